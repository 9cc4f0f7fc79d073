//! Admin-relay group membership.
//!
//! The creator of a group stays its admin for the whole session. Every
//! membership change and every group message passes through the admin, who
//! fans it out to the other members. Members only ever talk to the admin
//! about a group.
//!
//! [`GroupDirectory`] never touches the network: each operation returns the
//! [`Effects`] the node has to carry out.

use crate::app::events::{AppEvent, Effects};
use crate::transport::{
    Command, GroupInvite, GroupInviteResponse, GroupKick, GroupMemberRef, GroupMessage, GroupRef,
    UserJoinedGroup,
};
use crate::utils::{GroupError, MessengerError, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// A group as seen by one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Unique id, generated by the admin
    pub group_id: String,
    /// Display name
    pub name: String,
    /// Creator and relay hub
    pub admin: String,
    /// Members, admin included
    pub members: BTreeSet<String>,
}

impl GroupRecord {
    /// A group whose only member is its admin
    pub fn new(group_id: impl Into<String>, name: impl Into<String>, admin: impl Into<String>) -> Self {
        let admin = admin.into();
        let mut members = BTreeSet::new();
        members.insert(admin.clone());
        Self {
            group_id: group_id.into(),
            name: name.into(),
            admin,
            members,
        }
    }

    /// Whether `username` belongs to the group
    pub fn is_member(&self, username: &str) -> bool {
        self.members.contains(username)
    }

    fn others<'a>(&'a self, excluded: &'a [&'a str]) -> impl Iterator<Item = &'a String> + 'a {
        self.members
            .iter()
            .filter(move |m| !excluded.contains(&m.as_str()))
    }
}

#[derive(Debug, Clone)]
struct ReceivedInvite {
    admin: String,
    group_name: String,
}

/// Groups this node belongs to, plus invitations in both directions
#[derive(Debug)]
pub struct GroupDirectory {
    local: String,
    groups: HashMap<String, GroupRecord>,
    /// Admin side: group id -> invited usernames
    outstanding_invites: HashMap<String, BTreeSet<String>>,
    /// Member side: group id -> who invited us
    received_invites: HashMap<String, ReceivedInvite>,
}

impl GroupDirectory {
    /// Empty directory for `local`
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            groups: HashMap::new(),
            outstanding_invites: HashMap::new(),
            received_invites: HashMap::new(),
        }
    }

    /// Create a group with a fresh id. Returns the id.
    pub fn create(&mut self, name: &str) -> (String, Effects) {
        let group_id = Uuid::new_v4().to_string();
        let group = GroupRecord::new(&group_id, name, &self.local);
        self.groups.insert(group_id.clone(), group.clone());

        let mut effects = Effects::none();
        effects.emit(AppEvent::GroupCreated { group });
        (group_id, effects)
    }

    /// Create a group under a caller-chosen id
    ///
    /// # Errors
    ///
    /// Returns `GroupError::AlreadyExists` when the id is taken locally
    pub fn create_with_id(&mut self, group_id: &str, name: &str) -> Result<Effects> {
        if self.groups.contains_key(group_id) {
            return Err(GroupError::AlreadyExists {
                group_id: group_id.to_string(),
            }
            .into());
        }
        let group = GroupRecord::new(group_id, name, &self.local);
        self.groups.insert(group_id.to_string(), group.clone());

        let mut effects = Effects::none();
        effects.emit(AppEvent::GroupCreated { group });
        Ok(effects)
    }

    /// Invite `target` into a group we administer
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotFound` or `GroupError::NotAdmin`
    pub fn invite(&mut self, group_id: &str, target: &str) -> Result<Effects> {
        let group = self.admin_group(group_id)?;
        let command = Command::GroupInvite(GroupInvite {
            group_id: group_id.to_string(),
            group_name: group.name.clone(),
        });
        self.outstanding_invites
            .entry(group_id.to_string())
            .or_default()
            .insert(target.to_string());

        let mut effects = Effects::none();
        effects.send(target, command);
        Ok(effects)
    }

    /// An admin invited us
    pub fn on_invite(&mut self, from: &str, invite: GroupInvite) -> Effects {
        let mut effects = Effects::none();
        if self.groups.contains_key(&invite.group_id) {
            log::debug!("Ignoring invite to {}: already a member", invite.group_id);
            return effects;
        }
        self.received_invites.insert(
            invite.group_id.clone(),
            ReceivedInvite {
                admin: from.to_string(),
                group_name: invite.group_name.clone(),
            },
        );
        effects.emit(AppEvent::GroupInvite {
            from: from.to_string(),
            group_id: invite.group_id,
            group_name: invite.group_name,
        });
        effects
    }

    /// Answer a received invite
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NoPendingInvite` if nobody invited us
    pub fn respond_invite(&mut self, group_id: &str, accept: bool) -> Result<Effects> {
        let invite = self.take_received_invite(group_id)?;
        let mut effects = Effects::none();
        effects.send(
            invite.admin,
            Command::GroupInviteResponse(GroupInviteResponse {
                group_id: group_id.to_string(),
                accepted: accept,
            }),
        );
        Ok(effects)
    }

    /// Ask the admin to let us in, using a received invite
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NoPendingInvite` if nobody invited us
    pub fn join(&mut self, group_id: &str) -> Result<Effects> {
        let invite = self.take_received_invite(group_id)?;
        let mut effects = Effects::none();
        effects.send(
            invite.admin,
            Command::JoinGroup(GroupRef {
                group_id: group_id.to_string(),
            }),
        );
        Ok(effects)
    }

    /// An invitee answered. Admits them on acceptance.
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin or never invited `from`
    pub fn on_invite_response(&mut self, from: &str, response: GroupInviteResponse) -> Result<Effects> {
        self.admin_group(&response.group_id)?;
        self.take_outstanding_invite(&response.group_id, from)?;

        let mut effects = Effects::none();
        effects.emit(AppEvent::GroupInviteResponse {
            from: from.to_string(),
            group_id: response.group_id.clone(),
            accepted: response.accepted,
        });
        if response.accepted {
            effects.extend(self.admit(&response.group_id, from)?);
        }
        Ok(effects)
    }

    /// An invitee asked to join
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin or never invited `from`
    pub fn on_join_request(&mut self, from: &str, request: GroupRef) -> Result<Effects> {
        self.admin_group(&request.group_id)?;
        self.take_outstanding_invite(&request.group_id, from)?;
        self.admit(&request.group_id, from)
    }

    fn admit(&mut self, group_id: &str, newcomer: &str) -> Result<Effects> {
        let local = self.local.clone();
        let group = self.group_mut(group_id)?;
        group.members.insert(newcomer.to_string());
        let snapshot = group.clone();

        let mut effects = Effects::none();
        effects.send(
            newcomer,
            Command::UserJoinedGroup(UserJoinedGroup {
                group_id: group_id.to_string(),
                username: None,
                group_info: Some(snapshot.clone()),
            }),
        );
        for member in snapshot.others(&[local.as_str(), newcomer]) {
            effects.send(
                member.as_str(),
                Command::UserJoinedGroup(UserJoinedGroup {
                    group_id: group_id.to_string(),
                    username: Some(newcomer.to_string()),
                    group_info: None,
                }),
            );
        }
        effects.emit(AppEvent::UserJoinedGroup {
            group_id: group_id.to_string(),
            username: newcomer.to_string(),
        });
        log::info!("{} joined group {}", newcomer, group_id);
        Ok(effects)
    }

    /// Admin notice about a join: full state when it is us, a name otherwise
    ///
    /// # Errors
    ///
    /// Fails when `from` is not the group's admin or the payload carries
    /// neither field
    pub fn on_user_joined(&mut self, from: &str, notice: UserJoinedGroup) -> Result<Effects> {
        let mut effects = Effects::none();

        if let Some(info) = notice.group_info {
            if info.admin != from {
                return Err(not_from_admin("user_joined_group", from));
            }
            if !info.is_member(&self.local) {
                return Err(GroupError::NotMember {
                    group_id: info.group_id,
                    username: self.local.clone(),
                }
                .into());
            }
            self.received_invites.remove(&info.group_id);
            self.groups.insert(info.group_id.clone(), info.clone());
            effects.emit(AppEvent::GroupJoined { group: info });
            return Ok(effects);
        }

        let username = notice.username.ok_or_else(|| ProtocolError::MissingField {
            field: "username".to_string(),
        })?;
        let group = self.group_mut(&notice.group_id)?;
        if group.admin != from {
            return Err(not_from_admin("user_joined_group", from));
        }
        group.members.insert(username.clone());
        effects.emit(AppEvent::UserJoinedGroup {
            group_id: notice.group_id,
            username,
        });
        Ok(effects)
    }

    /// Send a group message. Members hand it to the admin, the admin fans out.
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotFound` for unknown groups
    pub fn send_message(&self, group_id: &str, message: Value) -> Result<Effects> {
        let group = self.group(group_id).ok_or_else(|| not_found(group_id))?;
        let command = Command::GroupMessage(GroupMessage {
            group_id: group_id.to_string(),
            sender: self.local.clone(),
            message_data: message,
        });

        let mut effects = Effects::none();
        if group.admin == self.local {
            for member in group.others(&[self.local.as_str()]) {
                effects.send(member.as_str(), command.clone());
            }
        } else {
            effects.send(group.admin.as_str(), command);
        }
        Ok(effects)
    }

    /// Handle a group message. The admin relays it to everyone but the author.
    ///
    /// # Errors
    ///
    /// Fails for unknown groups, relays from non-admins and, on the admin,
    /// messages from non-members
    pub fn on_group_message(&self, from: &str, message: GroupMessage) -> Result<Effects> {
        let group = self
            .group(&message.group_id)
            .ok_or_else(|| not_found(&message.group_id))?;
        let mut effects = Effects::none();

        if group.admin == self.local {
            if !group.is_member(from) {
                return Err(GroupError::NotMember {
                    group_id: message.group_id,
                    username: from.to_string(),
                }
                .into());
            }
            let relayed = Command::GroupMessage(GroupMessage {
                group_id: message.group_id.clone(),
                sender: from.to_string(),
                message_data: message.message_data.clone(),
            });
            for member in group.others(&[self.local.as_str(), from]) {
                effects.send(member.as_str(), relayed.clone());
            }
            effects.emit(AppEvent::GroupMessageReceived {
                group_id: message.group_id,
                sender: from.to_string(),
                message: message.message_data,
            });
        } else {
            if group.admin != from {
                return Err(not_from_admin("group_message", from));
            }
            effects.emit(AppEvent::GroupMessageReceived {
                group_id: message.group_id,
                sender: message.sender,
                message: message.message_data,
            });
        }
        Ok(effects)
    }

    /// Remove a member and tell every original member, the kicked one included
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin, when `target` is the admin or when
    /// `target` is not a member
    pub fn kick(&mut self, group_id: &str, target: &str) -> Result<Effects> {
        let local = self.local.clone();
        self.admin_group(group_id)?;
        if target == local {
            return Err(GroupError::AdminCannotLeave {
                group_id: group_id.to_string(),
            }
            .into());
        }
        let group = self.group_mut(group_id)?;
        let original = group.members.clone();
        if !group.members.remove(target) {
            return Err(GroupError::NotMember {
                group_id: group_id.to_string(),
                username: target.to_string(),
            }
            .into());
        }

        let command = Command::GroupKick(GroupKick {
            group_id: group_id.to_string(),
            kicked_user: target.to_string(),
            admin: local.clone(),
        });
        let mut effects = Effects::none();
        for member in original.iter().filter(|m| **m != local) {
            effects.send(member.as_str(), command.clone());
        }
        effects.emit(AppEvent::UserKicked {
            group_id: group_id.to_string(),
            username: target.to_string(),
        });
        log::info!("Kicked {} from group {}", target, group_id);
        Ok(effects)
    }

    /// Admin notice about a kick
    ///
    /// # Errors
    ///
    /// Fails for unknown groups and notices not sent by the admin
    pub fn on_kick(&mut self, from: &str, kick: GroupKick) -> Result<Effects> {
        let local = self.local.clone();
        let group = self.group_mut(&kick.group_id)?;
        if group.admin != from || kick.admin != from {
            return Err(not_from_admin("group_kick", from));
        }

        if kick.kicked_user == local {
            self.groups.remove(&kick.group_id);
            log::info!("We were kicked from group {}", kick.group_id);
        } else {
            group.members.remove(&kick.kicked_user);
        }

        let mut effects = Effects::none();
        effects.emit(AppEvent::UserKicked {
            group_id: kick.group_id,
            username: kick.kicked_user,
        });
        Ok(effects)
    }

    /// Leave a group we do not administer
    ///
    /// # Errors
    ///
    /// Returns `GroupError::AdminCannotLeave` for our own groups
    pub fn leave(&mut self, group_id: &str) -> Result<Effects> {
        let group = self.group(group_id).ok_or_else(|| not_found(group_id))?;
        if group.admin == self.local {
            return Err(GroupError::AdminCannotLeave {
                group_id: group_id.to_string(),
            }
            .into());
        }
        let admin = group.admin.clone();
        self.groups.remove(group_id);

        let mut effects = Effects::none();
        effects
            .send(
                admin,
                Command::LeaveGroup(GroupRef {
                    group_id: group_id.to_string(),
                }),
            )
            .emit(AppEvent::GroupLeft {
                group_id: group_id.to_string(),
            });
        Ok(effects)
    }

    /// A member told the admin it leaves
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin or `from` is not a member
    pub fn on_leave(&mut self, from: &str, request: GroupRef) -> Result<Effects> {
        let local = self.local.clone();
        self.admin_group(&request.group_id)?;
        let group = self.group_mut(&request.group_id)?;
        if from == local || !group.members.remove(from) {
            return Err(GroupError::NotMember {
                group_id: request.group_id,
                username: from.to_string(),
            }
            .into());
        }

        let mut effects = Effects::none();
        let notice = Command::UserLeftGroup(GroupMemberRef {
            group_id: request.group_id.clone(),
            username: from.to_string(),
        });
        for member in group.others(&[local.as_str()]) {
            effects.send(member.as_str(), notice.clone());
        }
        effects.emit(AppEvent::UserLeftGroup {
            group_id: request.group_id,
            username: from.to_string(),
        });
        Ok(effects)
    }

    /// Admin notice about a departure
    ///
    /// # Errors
    ///
    /// Fails for unknown groups and notices not sent by the admin
    pub fn on_user_left(&mut self, from: &str, notice: GroupMemberRef) -> Result<Effects> {
        let group = self.group_mut(&notice.group_id)?;
        if group.admin != from {
            return Err(not_from_admin("user_left_group", from));
        }
        group.members.remove(&notice.username);

        let mut effects = Effects::none();
        effects.emit(AppEvent::UserLeftGroup {
            group_id: notice.group_id,
            username: notice.username,
        });
        Ok(effects)
    }

    /// Members of a group, sorted
    pub fn members(&self, group_id: &str) -> Option<Vec<String>> {
        self.groups
            .get(group_id)
            .map(|g| g.members.iter().cloned().collect())
    }

    /// Look up a group
    pub fn group(&self, group_id: &str) -> Option<&GroupRecord> {
        self.groups.get(group_id)
    }

    /// Snapshot of every group we belong to
    pub fn groups(&self) -> Vec<GroupRecord> {
        self.groups.values().cloned().collect()
    }

    /// Whether we administer `group_id`
    pub fn is_admin(&self, group_id: &str) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|g| g.admin == self.local)
    }

    /// Invitations waiting for an answer: (group id, admin, group name)
    pub fn pending_invites(&self) -> Vec<(String, String, String)> {
        self.received_invites
            .iter()
            .map(|(id, inv)| (id.clone(), inv.admin.clone(), inv.group_name.clone()))
            .collect()
    }

    fn admin_group(&self, group_id: &str) -> Result<&GroupRecord> {
        let group = self.group(group_id).ok_or_else(|| not_found(group_id))?;
        if group.admin != self.local {
            return Err(GroupError::NotAdmin {
                group_id: group_id.to_string(),
            }
            .into());
        }
        Ok(group)
    }

    fn group_mut(&mut self, group_id: &str) -> Result<&mut GroupRecord> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| not_found(group_id))
    }

    fn take_received_invite(&mut self, group_id: &str) -> Result<ReceivedInvite> {
        self.received_invites.remove(group_id).ok_or_else(|| {
            GroupError::NoPendingInvite {
                group_id: group_id.to_string(),
            }
            .into()
        })
    }

    fn take_outstanding_invite(&mut self, group_id: &str, invitee: &str) -> Result<()> {
        let removed = self
            .outstanding_invites
            .get_mut(group_id)
            .is_some_and(|invitees| invitees.remove(invitee));
        if removed {
            Ok(())
        } else {
            Err(GroupError::NoPendingInvite {
                group_id: group_id.to_string(),
            }
            .into())
        }
    }
}

fn not_found(group_id: &str) -> MessengerError {
    GroupError::NotFound {
        group_id: group_id.to_string(),
    }
    .into()
}

fn not_from_admin(command: &str, from: &str) -> MessengerError {
    ProtocolError::NotAllowed {
        command: command.to_string(),
        reason: format!("{from} is not the group admin"),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Deliver every outbound command addressed to `node` and collect the
    /// resulting effects
    fn deliver(from: &str, effects: &Effects, node: &mut GroupDirectory) -> Effects {
        let mut out = Effects::none();
        for (to, command) in &effects.outbound {
            if *to != node.local {
                continue;
            }
            let produced = match command.clone() {
                Command::GroupInvite(p) => Ok(node.on_invite(from, p)),
                Command::GroupInviteResponse(p) => node.on_invite_response(from, p),
                Command::JoinGroup(p) => node.on_join_request(from, p),
                Command::UserJoinedGroup(p) => node.on_user_joined(from, p),
                Command::GroupMessage(p) => node.on_group_message(from, p),
                Command::GroupKick(p) => node.on_kick(from, p),
                Command::LeaveGroup(p) => node.on_leave(from, p),
                Command::UserLeftGroup(p) => node.on_user_left(from, p),
                other => panic!("unexpected command {}", other.name()),
            };
            out.extend(produced.unwrap());
        }
        out
    }

    fn accept_invite(alice: &mut GroupDirectory, invitee: &mut GroupDirectory) -> Effects {
        let name = invitee.local.clone();
        let invite = alice.invite("g1", &name).unwrap();
        deliver("alice", &invite, invitee);
        let answer = invitee.respond_invite("g1", true).unwrap();
        let fanout = deliver(&name, &answer, alice);
        deliver("alice", &fanout, invitee);
        fanout
    }

    fn three_member_group() -> (GroupDirectory, GroupDirectory, GroupDirectory) {
        let mut alice = GroupDirectory::new("alice");
        let mut bob = GroupDirectory::new("bob");
        let mut carol = GroupDirectory::new("carol");
        alice.create_with_id("g1", "G").unwrap();

        accept_invite(&mut alice, &mut bob);
        let fanout = accept_invite(&mut alice, &mut carol);
        deliver("alice", &fanout, &mut bob);
        (alice, bob, carol)
    }

    #[test]
    fn test_create() {
        let mut dir = GroupDirectory::new("alice");
        let (id, effects) = dir.create("Friends");

        assert!(dir.is_admin(&id));
        assert_eq!(dir.members(&id), Some(vec!["alice".to_string()]));
        assert!(matches!(effects.events[0], AppEvent::GroupCreated { .. }));
        assert!(dir.create_with_id(&id, "again").is_err());
    }

    #[test]
    fn test_invite_accept_flow() {
        let mut alice = GroupDirectory::new("alice");
        let mut bob = GroupDirectory::new("bob");
        alice.create_with_id("g1", "G").unwrap();

        let invite = alice.invite("g1", "bob").unwrap();
        let received = deliver("alice", &invite, &mut bob);
        assert_eq!(received.events[0].name(), "group_invite");

        let answer = bob.respond_invite("g1", true).unwrap();
        let fanout = deliver("bob", &answer, &mut alice);
        assert_eq!(
            alice.members("g1"),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        // Only the newcomer gets a message: nobody else to notify yet
        assert_eq!(fanout.recipients(), vec!["bob"]);

        let joined = deliver("alice", &fanout, &mut bob);
        match &joined.events[0] {
            AppEvent::GroupJoined { group } => {
                assert_eq!(group.admin, "alice");
                assert_eq!(group.name, "G");
                assert!(group.is_member("bob"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bob.members("g1"), alice.members("g1"));
    }

    #[test]
    fn test_declined_invite() {
        let mut alice = GroupDirectory::new("alice");
        let mut bob = GroupDirectory::new("bob");
        alice.create_with_id("g1", "G").unwrap();

        let invite = alice.invite("g1", "bob").unwrap();
        deliver("alice", &invite, &mut bob);
        let answer = bob.respond_invite("g1", false).unwrap();
        let result = deliver("bob", &answer, &mut alice);

        assert_eq!(
            result.events,
            vec![AppEvent::GroupInviteResponse {
                from: "bob".to_string(),
                group_id: "g1".to_string(),
                accepted: false,
            }]
        );
        assert!(result.outbound.is_empty());
        assert_eq!(alice.members("g1").unwrap().len(), 1);
    }

    #[test]
    fn test_uninvited_cannot_join() {
        let mut alice = GroupDirectory::new("alice");
        alice.create_with_id("g1", "G").unwrap();

        let err = alice
            .on_join_request(
                "mallory",
                GroupRef {
                    group_id: "g1".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Group(GroupError::NoPendingInvite { .. })
        ));

        let mut mallory = GroupDirectory::new("mallory");
        assert!(mallory.join("g1").is_err());
    }

    #[test]
    fn test_only_admin_invites() {
        let (_alice, mut bob, _carol) = three_member_group();
        let err = bob.invite("g1", "dave").unwrap_err();
        assert!(matches!(err, MessengerError::Group(GroupError::NotAdmin { .. })));
    }

    #[test]
    fn test_existing_members_learn_newcomer() {
        let (alice, bob, carol) = three_member_group();
        let expected = Some(vec![
            "alice".to_string(),
            "bob".to_string(),
            "carol".to_string(),
        ]);
        assert_eq!(alice.members("g1"), expected);
        assert_eq!(bob.members("g1"), expected);
        assert_eq!(carol.members("g1"), expected);
    }

    #[test]
    fn test_member_message_relayed_by_admin() {
        let (mut alice, bob, mut carol) = three_member_group();

        let sent = bob.send_message("g1", json!({"text": "hey"})).unwrap();
        assert_eq!(sent.recipients(), vec!["alice"]);

        let relayed = deliver("bob", &sent, &mut alice);
        assert_eq!(relayed.recipients(), vec!["carol"]);
        assert_eq!(relayed.events[0].name(), "group_message_received");

        let received = deliver("alice", &relayed, &mut carol);
        assert_eq!(
            received.events,
            vec![AppEvent::GroupMessageReceived {
                group_id: "g1".to_string(),
                sender: "bob".to_string(),
                message: json!({"text": "hey"}),
            }]
        );
    }

    #[test]
    fn test_admin_relay_forces_sender() {
        let (alice, _bob, _carol) = three_member_group();
        let forged = GroupMessage {
            group_id: "g1".to_string(),
            sender: "carol".to_string(),
            message_data: json!("spoof"),
        };
        let relayed = alice.on_group_message("bob", forged).unwrap();
        for (_, command) in &relayed.outbound {
            let Command::GroupMessage(m) = command else {
                panic!("expected group message");
            };
            assert_eq!(m.sender, "bob");
        }
    }

    #[test]
    fn test_member_rejects_message_not_from_admin() {
        let (_alice, bob, _carol) = three_member_group();
        let message = GroupMessage {
            group_id: "g1".to_string(),
            sender: "carol".to_string(),
            message_data: json!("direct"),
        };
        assert!(bob.on_group_message("carol", message).is_err());
    }

    #[test]
    fn test_kick_converges_everywhere() {
        let (mut alice, mut bob, mut carol) = three_member_group();

        let kick = alice.kick("g1", "bob").unwrap();
        let mut recipients = kick.recipients();
        recipients.sort_unstable();
        assert_eq!(recipients, vec!["bob", "carol"]);

        deliver("alice", &kick, &mut bob);
        deliver("alice", &kick, &mut carol);

        let expected = Some(vec!["alice".to_string(), "carol".to_string()]);
        assert_eq!(alice.members("g1"), expected);
        assert_eq!(carol.members("g1"), expected);
        assert!(bob.group("g1").is_none());

        // The admin no longer relays to or accepts from the kicked member
        let next = alice.send_message("g1", json!("after")).unwrap();
        assert_eq!(next.recipients(), vec!["carol"]);
        let late = GroupMessage {
            group_id: "g1".to_string(),
            sender: "bob".to_string(),
            message_data: json!("late"),
        };
        assert!(alice.on_group_message("bob", late).is_err());
    }

    #[test]
    fn test_admin_cannot_be_kicked_or_leave() {
        let (mut alice, mut bob, _carol) = three_member_group();
        assert!(alice.kick("g1", "alice").is_err());
        assert!(bob.kick("g1", "carol").is_err());
        assert!(matches!(
            alice.leave("g1").unwrap_err(),
            MessengerError::Group(GroupError::AdminCannotLeave { .. })
        ));
    }

    #[test]
    fn test_leave_fans_out() {
        let (mut alice, mut bob, mut carol) = three_member_group();

        let left = carol.leave("g1").unwrap();
        assert_eq!(left.recipients(), vec!["alice"]);
        assert!(carol.group("g1").is_none());

        let fanout = deliver("carol", &left, &mut alice);
        assert_eq!(fanout.recipients(), vec!["bob"]);
        let seen = deliver("alice", &fanout, &mut bob);

        assert_eq!(seen.events[0].name(), "user_left_group");
        assert_eq!(
            bob.members("g1"),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn test_kick_from_non_admin_ignored() {
        let (_alice, mut bob, _carol) = three_member_group();
        let forged = GroupKick {
            group_id: "g1".to_string(),
            kicked_user: "bob".to_string(),
            admin: "carol".to_string(),
        };
        assert!(bob.on_kick("carol", forged).is_err());
        assert!(bob.group("g1").is_some());
    }
}
