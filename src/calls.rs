//! Call signaling state machines.
//!
//! 1:1 calls move through
//!
//! ```text
//! caller:  Idle ─ start_call ─► Calling ─ punch ok ─► (request sent) ─ accept ─► Active
//! callee:  Idle ─ request ───► Ringing ─ answer ───► Answering ─ punch ok ──► Active
//! ```
//!
//! and fall back to `Idle` on reject, busy, hang up or a failed punch. A
//! request that arrives while any call is in progress is answered `busy`.
//!
//! Group calls are coordinated by the group admin, who keeps the participant
//! list and introduces every newcomer to the participants already present.
//! Media is out of scope: [`AppEvent::CallConnected`] tells the audio side
//! where to send.

use crate::app::events::{AppEvent, Effects};
use crate::groups::GroupRecord;
use crate::transport::{
    CallAnswer, CallOffer, CallResponse, Command, GroupCallAnswer, GroupCallHangUp, GroupCallOffer,
};
use crate::utils::{CallError, GroupError, Result};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// 1:1 call state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// No call
    Idle,
    /// We are calling `peer`; `reachable` is set once the punch succeeded
    /// and the request went out
    Calling {
        /// Callee
        peer: String,
        /// Offered sample rate
        sample_rate: u32,
        /// Punched address
        reachable: Option<SocketAddr>,
    },
    /// `peer` is calling us
    Ringing {
        /// Caller
        peer: String,
        /// Offered sample rate
        sample_rate: u32,
    },
    /// We accepted and punch back before confirming
    Answering {
        /// Caller
        peer: String,
    },
    /// Media may flow
    Active {
        /// Other side
        peer: String,
        /// Punched address
        address: SocketAddr,
    },
}

impl CallState {
    /// The other party, if any
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Calling { peer, .. }
            | Self::Ringing { peer, .. }
            | Self::Answering { peer }
            | Self::Active { peer, .. } => Some(peer),
        }
    }
}

/// One group call as seen by one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCall {
    /// Group the call belongs to
    pub group_id: String,
    /// Group admin, coordinator of the call
    pub admin: String,
    /// Everyone currently in the call, us included
    pub participants: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct GroupCallInvitation {
    admin: String,
    sample_rate: u32,
}

/// Per-node call signaling
#[derive(Debug)]
pub struct CallManager {
    local: String,
    state: CallState,
    group_call: Option<GroupCall>,
    invitations: HashMap<String, GroupCallInvitation>,
}

impl CallManager {
    /// Idle manager for `local`
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            state: CallState::Idle,
            group_call: None,
            invitations: HashMap::new(),
        }
    }

    /// Current 1:1 state
    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// The group call we are in
    pub fn group_call(&self) -> Option<&GroupCall> {
        self.group_call.as_ref()
    }

    /// Whether a new call would be refused
    pub fn is_busy(&self) -> bool {
        self.state != CallState::Idle || self.group_call.is_some()
    }

    /// Start calling `peer`. The request goes out once the punch succeeds.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Busy` while another call is in progress
    pub fn start_call(&mut self, peer: &str, sample_rate: u32) -> Result<Effects> {
        if self.is_busy() {
            return Err(CallError::Busy.into());
        }
        self.state = CallState::Calling {
            peer: peer.to_string(),
            sample_rate,
            reachable: None,
        };
        let mut effects = Effects::none();
        effects.punch(peer);
        Ok(effects)
    }

    /// A hole punch towards `peer` succeeded
    pub fn on_punch_success(&mut self, peer: &str, address: SocketAddr) -> Effects {
        let mut effects = Effects::none();

        if let CallState::Calling {
            peer: callee,
            sample_rate,
            reachable,
        } = &mut self.state
        {
            if callee.as_str() == peer && reachable.is_none() {
                *reachable = Some(address);
                effects.send(
                    peer,
                    Command::P2pCallRequest(CallOffer {
                        sample_rate: *sample_rate,
                    }),
                );
                return effects;
            }
        }

        if matches!(&self.state, CallState::Answering { peer: caller } if caller.as_str() == peer) {
            self.state = CallState::Active {
                peer: peer.to_string(),
                address,
            };
            effects
                .send(
                    peer,
                    Command::P2pCallResponse(CallAnswer {
                        response: CallResponse::Accept,
                    }),
                )
                .emit(AppEvent::CallConnected {
                    peer: peer.to_string(),
                    address,
                });
            return effects;
        }

        let in_group_call = self
            .group_call
            .as_ref()
            .is_some_and(|call| call.participants.contains(peer));
        if in_group_call {
            effects.emit(AppEvent::CallConnected {
                peer: peer.to_string(),
                address,
            });
        }
        effects
    }

    /// A hole punch towards `peer` gave up
    pub fn on_punch_failure(&mut self, peer: &str) -> Effects {
        let mut effects = Effects::none();
        let pending = match &self.state {
            CallState::Calling {
                peer: callee,
                reachable: None,
                ..
            } => callee == peer,
            CallState::Answering { peer: caller } => caller == peer,
            _ => false,
        };
        if pending {
            self.state = CallState::Idle;
            effects.emit(AppEvent::CallFailed {
                peer: peer.to_string(),
                reason: "peer unreachable".to_string(),
            });
        }
        effects
    }

    /// A peer is calling us
    pub fn on_call_request(&mut self, from: &str, offer: CallOffer) -> Effects {
        let mut effects = Effects::none();
        if self.is_busy() {
            log::info!("Rejecting call from {}: busy", from);
            effects.send(
                from,
                Command::P2pCallResponse(CallAnswer {
                    response: CallResponse::Busy,
                }),
            );
            return effects;
        }
        self.state = CallState::Ringing {
            peer: from.to_string(),
            sample_rate: offer.sample_rate,
        };
        effects.emit(AppEvent::IncomingP2pCall {
            from: from.to_string(),
            sample_rate: offer.sample_rate,
        });
        effects
    }

    /// Answer the ringing call. Accepting punches back before confirming.
    ///
    /// # Errors
    ///
    /// Returns `CallError::NotRinging` when nobody is calling
    pub fn answer(&mut self, accept: bool) -> Result<Effects> {
        let CallState::Ringing { peer, .. } = &self.state else {
            return Err(CallError::NotRinging.into());
        };
        let peer = peer.clone();
        let mut effects = Effects::none();
        if accept {
            self.state = CallState::Answering { peer: peer.clone() };
            effects.punch(peer);
        } else {
            self.state = CallState::Idle;
            effects.send(
                peer,
                Command::P2pCallResponse(CallAnswer {
                    response: CallResponse::Reject,
                }),
            );
        }
        Ok(effects)
    }

    /// The callee answered
    pub fn on_call_response(&mut self, from: &str, answer: CallAnswer) -> Effects {
        let mut effects = Effects::none();
        let CallState::Calling {
            peer,
            reachable: Some(address),
            ..
        } = &self.state
        else {
            log::debug!("Ignoring call response from {}: not calling", from);
            return effects;
        };
        if peer != from {
            log::debug!("Ignoring call response from {}: calling {}", from, peer);
            return effects;
        }
        let address = *address;

        effects.emit(AppEvent::P2pCallResponse {
            from: from.to_string(),
            response: answer.response,
        });
        if answer.response == CallResponse::Accept {
            self.state = CallState::Active {
                peer: from.to_string(),
                address,
            };
            effects.emit(AppEvent::CallConnected {
                peer: from.to_string(),
                address,
            });
        } else {
            self.state = CallState::Idle;
        }
        effects
    }

    /// End or decline the current 1:1 call
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoActiveCall` when idle
    pub fn hang_up(&mut self) -> Result<Effects> {
        let previous = std::mem::replace(&mut self.state, CallState::Idle);
        let mut effects = Effects::none();
        match previous {
            CallState::Idle => return Err(CallError::NoActiveCall.into()),
            CallState::Ringing { peer, .. } => {
                effects.send(
                    peer,
                    Command::P2pCallResponse(CallAnswer {
                        response: CallResponse::Reject,
                    }),
                );
            }
            CallState::Calling { peer, .. }
            | CallState::Answering { peer }
            | CallState::Active { peer, .. } => {
                effects.send(peer, Command::P2pHangUp);
            }
        }
        Ok(effects)
    }

    /// The other side hung up
    pub fn on_hang_up(&mut self, from: &str) -> Effects {
        let mut effects = Effects::none();
        if self.state.peer() == Some(from) {
            self.state = CallState::Idle;
            effects.emit(AppEvent::P2pHangUp {
                from: from.to_string(),
            });
        }
        effects
    }

    /// Start a group call as the group's admin
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin or already in a call
    pub fn start_group_call(&mut self, group: &GroupRecord, sample_rate: u32) -> Result<Effects> {
        if group.admin != self.local {
            return Err(GroupError::NotAdmin {
                group_id: group.group_id.clone(),
            }
            .into());
        }
        if self.is_busy() {
            return Err(CallError::Busy.into());
        }
        let mut participants = BTreeSet::new();
        participants.insert(self.local.clone());
        self.group_call = Some(GroupCall {
            group_id: group.group_id.clone(),
            admin: self.local.clone(),
            participants,
        });

        let mut effects = Effects::none();
        for member in group.members.iter().filter(|m| **m != self.local) {
            effects.send(
                member.as_str(),
                Command::GroupCallRequest(GroupCallOffer {
                    group_id: group.group_id.clone(),
                    sample_rate,
                }),
            );
        }
        Ok(effects)
    }

    /// The admin of a group we belong to started a call
    pub fn on_group_call_request(
        &mut self,
        from: &str,
        offer: GroupCallOffer,
        group: Option<&GroupRecord>,
    ) -> Effects {
        let mut effects = Effects::none();
        if !group.is_some_and(|g| g.admin == from && g.is_member(&self.local)) {
            log::warn!(
                "Ignoring group call for {} from {}: not our group admin",
                offer.group_id,
                from
            );
            return effects;
        }
        if self.is_busy() {
            effects.send(
                from,
                Command::GroupCallResponse(GroupCallAnswer {
                    group_id: offer.group_id,
                    participant: self.local.clone(),
                    response: CallResponse::Busy,
                }),
            );
            return effects;
        }
        self.invitations.insert(
            offer.group_id.clone(),
            GroupCallInvitation {
                admin: from.to_string(),
                sample_rate: offer.sample_rate,
            },
        );
        effects.emit(AppEvent::IncomingGroupCall {
            group_id: offer.group_id,
            from: from.to_string(),
            sample_rate: offer.sample_rate,
        });
        effects
    }

    /// Answer a group call invitation
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoInvitation` or, when accepting, `CallError::Busy`
    pub fn answer_group_call(&mut self, group_id: &str, accept: bool) -> Result<Effects> {
        let invitation = self
            .invitations
            .remove(group_id)
            .ok_or_else(|| CallError::NoInvitation {
                group_id: group_id.to_string(),
            })?;
        let mut effects = Effects::none();
        let response = if accept {
            if self.is_busy() {
                return Err(CallError::Busy.into());
            }
            let participants = [invitation.admin.clone(), self.local.clone()]
                .into_iter()
                .collect();
            self.group_call = Some(GroupCall {
                group_id: group_id.to_string(),
                admin: invitation.admin.clone(),
                participants,
            });
            effects.punch(invitation.admin.as_str());
            log::info!(
                "Joining group call {} at {} Hz",
                group_id,
                invitation.sample_rate
            );
            CallResponse::Accept
        } else {
            CallResponse::Reject
        };
        effects.send(
            invitation.admin,
            Command::GroupCallResponse(GroupCallAnswer {
                group_id: group_id.to_string(),
                participant: self.local.clone(),
                response,
            }),
        );
        Ok(effects)
    }

    /// A member answered (on the admin) or the admin introduced a
    /// participant (on a member). `group` is our record of the call's group;
    /// the admin only admits its current members.
    pub fn on_group_call_response(
        &mut self,
        from: &str,
        answer: GroupCallAnswer,
        group: Option<&GroupRecord>,
    ) -> Effects {
        let mut effects = Effects::none();
        let local = self.local.clone();
        let Some(call) = self
            .group_call
            .as_mut()
            .filter(|c| c.group_id == answer.group_id)
        else {
            log::debug!("Ignoring group call response for {}", answer.group_id);
            return effects;
        };

        if call.admin == local {
            if answer.participant != from {
                log::warn!("{} answered on behalf of {}", from, answer.participant);
                return effects;
            }
            if !group.is_some_and(|g| g.group_id == call.group_id && g.is_member(from)) {
                log::warn!("Ignoring group call answer from {}: not a member of {}", from, call.group_id);
                return effects;
            }
            if answer.response != CallResponse::Accept {
                log::info!("{} declined group call {}: {:?}", from, call.group_id, answer.response);
                return effects;
            }
            if !call.participants.insert(from.to_string()) {
                return effects;
            }
            for existing in call.participants.iter().filter(|p| **p != local && *p != from) {
                effects
                    .send(
                        from,
                        Command::GroupCallResponse(GroupCallAnswer {
                            group_id: call.group_id.clone(),
                            participant: existing.clone(),
                            response: CallResponse::Accept,
                        }),
                    )
                    .send(
                        existing.as_str(),
                        Command::GroupCallResponse(GroupCallAnswer {
                            group_id: call.group_id.clone(),
                            participant: from.to_string(),
                            response: CallResponse::Accept,
                        }),
                    );
            }
            effects
                .punch(from)
                .emit(AppEvent::GroupCallParticipantJoined {
                    group_id: call.group_id.clone(),
                    participant: from.to_string(),
                });
            return effects;
        }

        if call.admin != from || answer.participant == local {
            return effects;
        }
        if answer.response == CallResponse::Accept && call.participants.insert(answer.participant.clone()) {
            effects
                .punch(answer.participant.as_str())
                .emit(AppEvent::GroupCallParticipantJoined {
                    group_id: call.group_id.clone(),
                    participant: answer.participant,
                });
        }
        effects
    }

    /// Leave the group call. The admin leaving ends it for everyone.
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoActiveCall` when not in a group call
    pub fn leave_group_call(&mut self) -> Result<Effects> {
        let call = self.group_call.take().ok_or(CallError::NoActiveCall)?;
        let notice = Command::GroupCallHangUp(GroupCallHangUp {
            group_id: call.group_id.clone(),
            participant: self.local.clone(),
        });

        let mut effects = Effects::none();
        if call.admin == self.local {
            for participant in call.participants.iter().filter(|p| **p != self.local) {
                effects.send(participant.as_str(), notice.clone());
            }
        } else {
            effects.send(call.admin.as_str(), notice);
        }
        effects.emit(AppEvent::GroupCallEnded {
            group_id: call.group_id,
        });
        Ok(effects)
    }

    /// Someone left the group call
    pub fn on_group_call_hang_up(&mut self, from: &str, hang_up: GroupCallHangUp) -> Effects {
        let mut effects = Effects::none();
        let local = self.local.clone();
        let Some(call) = self
            .group_call
            .as_mut()
            .filter(|c| c.group_id == hang_up.group_id)
        else {
            return effects;
        };

        if call.admin == local {
            if hang_up.participant != from || !call.participants.remove(from) {
                return effects;
            }
            let relayed = Command::GroupCallHangUp(GroupCallHangUp {
                group_id: call.group_id.clone(),
                participant: from.to_string(),
            });
            for participant in call.participants.iter().filter(|p| **p != local) {
                effects.send(participant.as_str(), relayed.clone());
            }
            effects.emit(AppEvent::GroupCallParticipantLeft {
                group_id: call.group_id.clone(),
                participant: from.to_string(),
            });
            return effects;
        }

        if call.admin != from {
            return effects;
        }
        if hang_up.participant == call.admin {
            let group_id = call.group_id.clone();
            self.group_call = None;
            effects.emit(AppEvent::GroupCallEnded { group_id });
        } else if call.participants.remove(&hang_up.participant) {
            effects.emit(AppEvent::GroupCallParticipantLeft {
                group_id: call.group_id.clone(),
                participant: hang_up.participant,
            });
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn only_command(effects: &Effects) -> (&str, &Command) {
        assert_eq!(effects.outbound.len(), 1, "{effects:?}");
        let (to, command) = &effects.outbound[0];
        (to.as_str(), command)
    }

    #[test]
    fn test_request_waits_for_punch() {
        let mut alice = CallManager::new("alice");
        let effects = alice.start_call("bob", 48000).unwrap();
        assert!(effects.outbound.is_empty());
        assert_eq!(effects.punch, vec!["bob".to_string()]);

        let effects = alice.on_punch_success("bob", addr(1));
        assert_eq!(
            only_command(&effects),
            ("bob", &Command::P2pCallRequest(CallOffer { sample_rate: 48000 }))
        );
        // A second success for the same attempt does not resend
        assert!(alice.on_punch_success("bob", addr(1)).is_empty());
    }

    #[test]
    fn test_full_call_lifecycle() {
        let mut alice = CallManager::new("alice");
        let mut bob = CallManager::new("bob");

        alice.start_call("bob", 48000).unwrap();
        alice.on_punch_success("bob", addr(2));

        let ring = bob.on_call_request("alice", CallOffer { sample_rate: 48000 });
        assert_eq!(ring.events[0].name(), "incoming_p2p_call");
        assert!(matches!(bob.state(), CallState::Ringing { .. }));

        let answered = bob.answer(true).unwrap();
        assert_eq!(answered.punch, vec!["alice".to_string()]);
        assert!(answered.outbound.is_empty());

        let confirmed = bob.on_punch_success("alice", addr(1));
        let (to, command) = only_command(&confirmed);
        assert_eq!(to, "alice");
        let Command::P2pCallResponse(answer) = command.clone() else {
            panic!("expected call response");
        };
        assert_eq!(bob.state(), &CallState::Active { peer: "alice".to_string(), address: addr(1) });

        let connected = alice.on_call_response("bob", answer);
        assert!(connected
            .events
            .contains(&AppEvent::CallConnected { peer: "bob".to_string(), address: addr(2) }));

        let hang = alice.hang_up().unwrap();
        assert_eq!(only_command(&hang), ("bob", &Command::P2pHangUp));
        assert_eq!(alice.state(), &CallState::Idle);

        let ended = bob.on_hang_up("alice");
        assert_eq!(ended.events[0].name(), "p2p_hang_up");
        assert_eq!(bob.state(), &CallState::Idle);
    }

    #[test]
    fn test_busy_when_in_call() {
        let mut bob = CallManager::new("bob");
        bob.on_call_request("alice", CallOffer { sample_rate: 48000 });

        let effects = bob.on_call_request("carol", CallOffer { sample_rate: 16000 });
        assert_eq!(
            only_command(&effects),
            (
                "carol",
                &Command::P2pCallResponse(CallAnswer { response: CallResponse::Busy })
            )
        );
        // Still ringing for alice
        assert_eq!(bob.state().peer(), Some("alice"));
        assert!(bob.start_call("dave", 48000).is_err());
    }

    #[test]
    fn test_reject_returns_to_idle() {
        let mut alice = CallManager::new("alice");
        let mut bob = CallManager::new("bob");
        alice.start_call("bob", 48000).unwrap();
        alice.on_punch_success("bob", addr(2));
        bob.on_call_request("alice", CallOffer { sample_rate: 48000 });

        let declined = bob.answer(false).unwrap();
        let Command::P2pCallResponse(answer) = declined.outbound[0].1.clone() else {
            panic!("expected call response");
        };
        let result = alice.on_call_response("bob", answer);
        assert_eq!(
            result.events,
            vec![AppEvent::P2pCallResponse { from: "bob".to_string(), response: CallResponse::Reject }]
        );
        assert_eq!(alice.state(), &CallState::Idle);
        assert!(bob.answer(true).is_err());
    }

    #[test]
    fn test_failed_punch_fails_call() {
        let mut alice = CallManager::new("alice");
        alice.start_call("bob", 48000).unwrap();
        assert!(alice.on_punch_failure("carol").is_empty());

        let effects = alice.on_punch_failure("bob");
        assert_eq!(effects.events[0].name(), "call_failed");
        assert_eq!(alice.state(), &CallState::Idle);
    }

    #[test]
    fn test_hang_up_when_idle() {
        let mut alice = CallManager::new("alice");
        assert!(alice.hang_up().is_err());
        assert!(alice.on_hang_up("bob").is_empty());
    }

    fn group() -> GroupRecord {
        let mut group = GroupRecord::new("g1", "G", "alice");
        group.members.insert("bob".to_string());
        group.members.insert("carol".to_string());
        group
    }

    fn deliver(from: &str, effects: &Effects, node: &mut CallManager, group: &GroupRecord) -> Effects {
        let mut out = Effects::none();
        for (to, command) in &effects.outbound {
            if *to != node.local {
                continue;
            }
            out.extend(match command.clone() {
                Command::GroupCallRequest(p) => node.on_group_call_request(from, p, Some(group)),
                Command::GroupCallResponse(p) => node.on_group_call_response(from, p, Some(group)),
                Command::GroupCallHangUp(p) => node.on_group_call_hang_up(from, p),
                other => panic!("unexpected command {}", other.name()),
            });
        }
        out
    }

    #[test]
    fn test_group_call_mesh() {
        let group = group();
        let mut alice = CallManager::new("alice");
        let mut bob = CallManager::new("bob");
        let mut carol = CallManager::new("carol");

        let invite = alice.start_group_call(&group, 48000).unwrap();
        assert_eq!(invite.recipients(), vec!["bob", "carol"]);
        assert!(bob.start_group_call(&group, 48000).is_err());

        deliver("alice", &invite, &mut bob, &group);
        deliver("alice", &invite, &mut carol, &group);

        let bob_yes = bob.answer_group_call("g1", true).unwrap();
        assert_eq!(bob_yes.punch, vec!["alice".to_string()]);
        let intro = deliver("bob", &bob_yes, &mut alice, &group);
        assert!(intro.outbound.is_empty());
        assert_eq!(intro.punch, vec!["bob".to_string()]);

        let carol_yes = carol.answer_group_call("g1", true).unwrap();
        let intro = deliver("carol", &carol_yes, &mut alice, &group);
        // carol learns about bob, bob learns about carol
        let mut recipients = intro.recipients();
        recipients.sort_unstable();
        assert_eq!(recipients, vec!["bob", "carol"]);

        let at_bob = deliver("alice", &intro, &mut bob, &group);
        let at_carol = deliver("alice", &intro, &mut carol, &group);
        assert_eq!(at_bob.punch, vec!["carol".to_string()]);
        assert_eq!(at_carol.punch, vec!["bob".to_string()]);

        let everyone: BTreeSet<String> = ["alice", "bob", "carol"].iter().map(ToString::to_string).collect();
        assert_eq!(alice.group_call().unwrap().participants, everyone);
        assert_eq!(bob.group_call().unwrap().participants, everyone);
        assert_eq!(carol.group_call().unwrap().participants, everyone);

        // carol leaves, the admin relays to bob
        let bye = carol.leave_group_call().unwrap();
        let relayed = deliver("carol", &bye, &mut alice, &group);
        assert_eq!(relayed.recipients(), vec!["bob"]);
        let at_bob = deliver("alice", &relayed, &mut bob, &group);
        assert_eq!(at_bob.events[0].name(), "group_call_participant_left");
        assert!(!bob.group_call().unwrap().participants.contains("carol"));

        // admin hangs up: call over for bob
        let end = alice.leave_group_call().unwrap();
        let at_bob = deliver("alice", &end, &mut bob, &group);
        assert_eq!(at_bob.events[0].name(), "group_call_ended");
        assert!(bob.group_call().is_none());
    }

    #[test]
    fn test_group_call_from_non_admin_ignored() {
        let group = group();
        let mut carol = CallManager::new("carol");
        let effects = carol.on_group_call_request(
            "bob",
            GroupCallOffer { group_id: "g1".to_string(), sample_rate: 48000 },
            Some(&group),
        );
        assert!(effects.is_empty());
        assert!(carol.answer_group_call("g1", true).is_err());
    }

    #[test]
    fn test_admin_ignores_answers_from_outsiders() {
        let mut group = group();
        let mut alice = CallManager::new("alice");
        alice.start_group_call(&group, 48000).unwrap();

        let answer = |participant: &str| GroupCallAnswer {
            group_id: "g1".to_string(),
            participant: participant.to_string(),
            response: CallResponse::Accept,
        };

        let effects = alice.on_group_call_response("mallory", answer("mallory"), Some(&group));
        assert!(effects.is_empty());
        assert!(alice.on_group_call_response("bob", answer("bob"), None).is_empty());

        // A member kicked after the call started is no longer admitted
        group.members.remove("carol");
        assert!(alice.on_group_call_response("carol", answer("carol"), Some(&group)).is_empty());

        let joined = alice.on_group_call_response("bob", answer("bob"), Some(&group));
        assert_eq!(joined.punch, vec!["bob".to_string()]);

        let participants: Vec<&str> = alice
            .group_call()
            .unwrap()
            .participants
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(participants, vec!["alice", "bob"]);
    }

    #[test]
    fn test_busy_member_declines_group_call() {
        let group = group();
        let mut bob = CallManager::new("bob");
        bob.start_call("dave", 48000).unwrap();

        let effects = bob.on_group_call_request(
            "alice",
            GroupCallOffer { group_id: "g1".to_string(), sample_rate: 48000 },
            Some(&group),
        );
        let (to, command) = only_command(&effects);
        assert_eq!(to, "alice");
        assert!(matches!(
            command,
            Command::GroupCallResponse(GroupCallAnswer { response: CallResponse::Busy, .. })
        ));
    }
}
