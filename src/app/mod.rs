//! Main application lifecycle and coordination.
//!
//! [`App`] is one overlay node. It owns the shared UDP transport and the
//! state every component mutates (peer table, sessions, groups, calls, hole
//! punch attempts, chat history) behind async locks, runs the long-lived
//! tasks (listener, beacon, sweep, republish, directory worker) and publishes
//! every outcome as an [`AppEvent`] on an unbounded channel.
//!
//! The inbound side lives in `router`, the outbound API in `outbound`.

pub mod events;
mod outbound;
mod router;


pub use events::{AppEvent, Effects};

use crate::{
    calls::{CallManager, CallState, GroupCall},
    crypto::IdentityKeyPair,
    groups::{GroupDirectory, GroupRecord},
    network::{
        hole_punch::candidates, local_ip, DirectoryHandle, DirectoryRecord, DiscoveryBeacon,
        HolePunchCoordinator, MemoryDirectory, PeerRecord, PeerTable, PunchPlan, StunClient,
    },
    session::SessionManager,
    transport::{Command, Frame, Transport, TransportStats},
    utils::{MessengerConfig, MessengerError, NetworkError, NetworkMode, Result},
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// State shared by every task of a node
struct Shared {
    username: String,
    config: MessengerConfig,
    transport: Arc<Transport>,
    local_ip: IpAddr,
    /// STUN result (internet mode)
    public_addr: Option<SocketAddr>,
    peers: RwLock<PeerTable>,
    sessions: RwLock<SessionManager>,
    groups: RwLock<GroupDirectory>,
    calls: Mutex<CallManager>,
    punches: Mutex<HolePunchCoordinator>,
    history: RwLock<HashMap<String, Vec<Value>>>,
    directory: Option<DirectoryHandle>,
    events: mpsc::UnboundedSender<AppEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One overlay node
///
/// Cloning is cheap; clones drive the same node.
#[derive(Clone)]
pub struct App {
    shared: Arc<Shared>,
}

/// Application statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Our username
    pub username: String,
    /// Address we announce on the LAN
    pub local_addr: SocketAddr,
    /// Address learned through STUN
    pub public_addr: Option<SocketAddr>,
    /// Entries in the peer table
    pub known_peers: usize,
    /// Peers with a confirmed secure channel
    pub secure_peers: usize,
    /// Groups we belong to
    pub groups: usize,
    /// Socket counters
    pub transport: TransportStats,
}

impl App {
    /// Start a node from a validated configuration.
    ///
    /// In internet mode with the DHT enabled this joins the Kademlia
    /// overlay; a DHT that cannot start only disables lookups.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, key generation fails or no
    /// UDP port can be bound
    pub async fn start(config: MessengerConfig) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        Self::launch(config, None).await
    }

    /// Start a node whose rendezvous directory is a process-local map
    /// shared with other nodes of the same process.
    ///
    /// # Errors
    ///
    /// Same as [`App::start`]
    pub async fn start_with_directory(
        config: MessengerConfig,
        directory: MemoryDirectory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        Self::launch(config, Some(directory)).await
    }

    async fn launch(
        config: MessengerConfig,
        memory_directory: Option<MemoryDirectory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AppEvent>)> {
        config.validate()?;
        let username = config.identity.username.clone();
        log::info!("Starting overlay node for {}", username);

        let bits = config.identity.rsa_key_bits;
        let identity = tokio::task::spawn_blocking(move || IdentityKeyPair::generate(bits))
            .await
            .map_err(|e| MessengerError::unexpected(format!("key generation task: {e}")))??;
        log::info!("RSA identity ready, fingerprint {}", identity.public_key().fingerprint());

        let transport = match config.network.mode {
            NetworkMode::Local => {
                Transport::bind_in_range(config.network.base_port, config.network.port_range).await?
            }
            NetworkMode::Internet => Transport::bind_ephemeral().await?,
        };
        let transport = Arc::new(transport);
        let local_ip = local_ip();
        let public_addr = match config.network.mode {
            NetworkMode::Local => None,
            NetworkMode::Internet => Some(discover_public_addr(&config, &transport, local_ip).await),
        };

        let stop = transport.stop_signal();
        let mut tasks = Vec::new();
        let directory = match memory_directory {
            Some(memory) => {
                let (handle, task) = DirectoryHandle::spawn_memory(memory, stop);
                tasks.push(task);
                Some(handle)
            }
            None if config.network.mode == NetworkMode::Internet && config.rendezvous.enable_dht => {
                match DirectoryHandle::spawn_kademlia(&config.rendezvous, stop) {
                    Ok((handle, task)) => {
                        tasks.push(task);
                        Some(handle)
                    }
                    Err(e) => {
                        log::warn!("DHT unavailable, lookups disabled: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Shared {
            username: username.clone(),
            peers: RwLock::new(PeerTable::new(config.discovery.liveness_timeout())),
            sessions: RwLock::new(SessionManager::new(&username, identity)),
            groups: RwLock::new(GroupDirectory::new(&username)),
            calls: Mutex::new(CallManager::new(&username)),
            punches: Mutex::new(HolePunchCoordinator::new(
                config.hole_punch.attempts,
                config.hole_punch.interval(),
            )),
            history: RwLock::new(HashMap::new()),
            transport,
            local_ip,
            public_addr,
            directory,
            events,
            tasks: Mutex::new(tasks),
            config,
        };
        let app = Self {
            shared: Arc::new(shared),
        };
        app.spawn_background_tasks().await;

        log::info!(
            "{} listening on {} (public {:?})",
            username,
            app.local_addr(),
            app.public_addr()
        );
        Ok((app, receiver))
    }

    async fn spawn_background_tasks(&self) {
        let mut handles = vec![
            tokio::spawn(self.clone().run_listener()),
            tokio::spawn(self.clone().run_sweep()),
        ];

        if self.shared.config.network.mode == NetworkMode::Local {
            let beacon = DiscoveryBeacon::new(
                self.shared.username.as_str(),
                self.shared.transport.port(),
                &self.shared.config.network,
                self.shared.config.discovery.beacon_interval(),
            );
            handles.push(tokio::spawn(beacon.run(Arc::clone(&self.shared.transport))));
        }
        if self.shared.directory.is_some() {
            handles.push(tokio::spawn(self.clone().run_republish()));
        }

        self.shared.tasks.lock().await.extend(handles);
    }

    async fn run_listener(self) {
        let mut buf = vec![0u8; self.shared.config.network.max_datagram_size];
        loop {
            match self.shared.transport.recv(&mut buf).await {
                Ok(Some((len, from))) => self.handle_datagram(&buf[..len], from).await,
                Ok(None) => break,
                Err(e) => log::warn!("Receive failed: {}", e),
            }
        }
        log::debug!("Listener for {} stopped", self.shared.username);
    }

    async fn run_sweep(self) {
        let mut stop = self.shared.transport.stop_signal();
        let mut ticker = interval(self.shared.config.discovery.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }
    }

    /// Drop peers that stayed silent past the liveness timeout
    pub(crate) async fn sweep(&self) {
        let lost = self.shared.peers.write().await.prune();
        for username in lost {
            log::info!("Peer {} lost", username);
            self.shared.sessions.write().await.remove_peer(&username);
            self.shared.punches.lock().await.forget(&username);
            self.emit(AppEvent::PeerLost { username });
        }
    }

    async fn run_republish(self) {
        let Some(directory) = self.shared.directory.clone() else {
            return;
        };
        let mut stop = self.shared.transport.stop_signal();
        let period = Duration::from_secs(self.shared.config.rendezvous.republish_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let record = DirectoryRecord::new(
            self.shared.local_ip,
            self.shared.public_addr,
            self.shared.transport.port(),
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = directory.publish(&self.shared.username, record.clone()) {
                        log::warn!("Directory publish failed: {}", e);
                        break;
                    }
                }
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }
    }

    /// Stop every loop. Idempotent.
    pub fn stop(&self) {
        self.shared.transport.stop();
    }

    /// Stop and wait for the long-lived tasks to finish
    pub async fn shutdown(&self) {
        log::info!("Shutting down node {}", self.shared.username);
        self.stop();
        let handles: Vec<_> = self.shared.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Task ended abnormally: {}", e);
            }
        }
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.shared.transport.is_stopped()
    }

    /// Our username
    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// Address peers on our network reach us at
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.shared.local_ip, self.shared.transport.port())
    }

    /// Bound UDP port
    pub fn port(&self) -> u16 {
        self.shared.transport.port()
    }

    /// Address learned through STUN, or the local fallback
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.shared.public_addr
    }

    /// The configuration the node runs with
    pub fn config(&self) -> &MessengerConfig {
        &self.shared.config
    }

    /// Snapshot of the peer table
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let mut records = self.shared.peers.read().await.records();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records
    }

    /// Look up one peer
    pub async fn peer(&self, username: &str) -> Option<PeerRecord> {
        self.shared.peers.read().await.lookup(username).ok()
    }

    /// Whether application traffic to `username` is possible
    pub async fn is_secure(&self, username: &str) -> bool {
        self.shared.sessions.read().await.is_secure(username)
    }

    /// Peers with a confirmed secure channel
    pub async fn secure_peers(&self) -> Vec<String> {
        self.shared.sessions.read().await.secure_peers()
    }

    /// A group we belong to
    pub async fn group(&self, group_id: &str) -> Option<GroupRecord> {
        self.shared.groups.read().await.group(group_id).cloned()
    }

    /// Members of a group, sorted
    pub async fn members(&self, group_id: &str) -> Option<Vec<String>> {
        self.shared.groups.read().await.members(group_id)
    }

    /// Every group we belong to
    pub async fn groups(&self) -> Vec<GroupRecord> {
        self.shared.groups.read().await.groups()
    }

    /// Group invitations waiting for an answer: (group id, admin, name)
    pub async fn pending_invites(&self) -> Vec<(String, String, String)> {
        self.shared.groups.read().await.pending_invites()
    }

    /// Current 1:1 call state
    pub async fn call_state(&self) -> CallState {
        self.shared.calls.lock().await.state().clone()
    }

    /// The group call we are in
    pub async fn group_call(&self) -> Option<GroupCall> {
        self.shared.calls.lock().await.group_call().cloned()
    }

    /// Get application statistics
    pub async fn stats(&self) -> AppStats {
        AppStats {
            username: self.shared.username.clone(),
            local_addr: self.local_addr(),
            public_addr: self.shared.public_addr,
            known_peers: self.shared.peers.read().await.len(),
            secure_peers: self.shared.sessions.read().await.secure_peers().len(),
            groups: self.shared.groups.read().await.groups().len(),
            transport: self.shared.transport.stats(),
        }
    }

    pub(crate) fn emit(&self, event: AppEvent) {
        log::debug!("[{}] event {}", self.shared.username, event.name());
        if self.shared.events.send(event).is_err() {
            log::trace!("No event subscriber for {}", self.shared.username);
        }
    }

    /// Send a command to a known peer. Application commands are wrapped in
    /// an `encrypted_message`; unknown peers produce a `PeerNotFound` event.
    pub(crate) async fn send_command(&self, to: &str, command: &Command) -> Result<()> {
        let target = self.shared.peers.read().await.target(to);
        match target {
            Ok(target) => self.send_to_addr(to, target, command).await,
            Err(e) => {
                self.emit(AppEvent::PeerNotFound {
                    username: to.to_string(),
                });
                Err(e)
            }
        }
    }

    pub(crate) async fn send_to_addr(&self, to: &str, target: SocketAddr, command: &Command) -> Result<()> {
        let frame = Frame::new(self.shared.username.as_str(), command)?;
        let frame = if command.is_control_plane() {
            frame
        } else {
            let inner = frame.to_bytes()?;
            let sealed = self.shared.sessions.read().await.encrypt_for(to, &inner)?;
            Frame::new(self.shared.username.as_str(), &Command::EncryptedMessage(sealed))?
        };
        self.shared.transport.send_frame(target, &frame).await
    }

    /// Carry out state machine effects: sends, then events, then punches.
    /// Immediate punch outcomes are processed in the same pass.
    pub(crate) async fn execute(&self, effects: Effects) {
        let mut queue = VecDeque::from([effects]);
        while let Some(effects) = queue.pop_front() {
            for (to, command) in effects.outbound {
                if let Err(e) = self.send_command(&to, &command).await {
                    log::warn!("Could not send {} to {}: {}", command.name(), to, e);
                }
            }
            for event in effects.events {
                self.emit(event);
            }
            for username in effects.punch {
                match self.start_punch(&username).await {
                    Ok(more) if !more.is_empty() => queue.push_back(more),
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Hole punch towards {} not started: {}", username, e);
                        queue.push_back(self.punch_failed(&username).await);
                    }
                }
            }
        }
    }

    /// Begin a hole punch. Returns the effects of an immediate success.
    async fn start_punch(&self, username: &str) -> Result<Effects> {
        let record = self.shared.peers.read().await.lookup(username);
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                self.emit(AppEvent::PeerNotFound {
                    username: username.to_string(),
                });
                return Err(e);
            }
        };

        let plan = self.shared.punches.lock().await.initiate(&record);
        match plan {
            PunchPlan::Immediate(address) => {
                log::info!("{} has no public address; assuming LAN reachability", username);
                Ok(self.punch_succeeded(username, address).await)
            }
            PunchPlan::Rounds { attempt_id } => {
                log::info!("Hole punching {} (attempt {})", username, attempt_id);
                tokio::spawn(self.clone().run_syn_rounds(username.to_string(), attempt_id));
                Ok(Effects::none())
            }
        }
    }

    fn run_syn_rounds(self, username: String, attempt_id: u64) -> BoxFuture<'static, ()> {
        async move {
            let (rounds, period) = {
                let punches = self.shared.punches.lock().await;
                (punches.rounds(), punches.interval())
            };
            let mut stop = self.shared.transport.stop_signal();

            for round in 1..=rounds {
                if !self.shared.punches.lock().await.is_punching(&username, attempt_id) {
                    return;
                }
                // Re-resolved every round: inbound SYNs refresh the public address
                let record = self.shared.peers.read().await.lookup(&username);
                let targets = record.map(|r| candidates(&r)).unwrap_or_default();
                for target in targets {
                    log::trace!("SYN {} -> {} (round {})", username, target, round);
                    if let Err(e) = self.send_to_addr(&username, target, &Command::HolePunchSyn).await {
                        log::debug!("SYN to {} failed: {}", target, e);
                    }
                }
                tokio::select! {
                    () = sleep(period) => {}
                    _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => return,
                }
            }

            let expired = self.shared.punches.lock().await.expire(&username, attempt_id);
            if expired {
                log::warn!("Hole punch towards {} failed after {} rounds", username, rounds);
                let effects = self.punch_failed(&username).await;
                self.execute(effects).await;
            }
        }
        .boxed()
    }

    pub(crate) async fn punch_succeeded(&self, username: &str, address: SocketAddr) -> Effects {
        log::info!("Hole punch with {} succeeded via {}", username, address);
        let mut effects = Effects::none();
        effects.emit(AppEvent::HolePunchSuccessful {
            username: username.to_string(),
            address,
        });
        effects.extend(self.shared.calls.lock().await.on_punch_success(username, address));
        effects
    }

    async fn punch_failed(&self, username: &str) -> Effects {
        let mut effects = Effects::none();
        effects.emit(AppEvent::HolePunchFailed {
            username: username.to_string(),
        });
        effects.extend(self.shared.calls.lock().await.on_punch_failure(username));
        effects
    }

    fn directory(&self) -> Result<&DirectoryHandle> {
        self.shared.directory.as_ref().ok_or_else(|| {
            NetworkError::DhtFailure {
                operation: "lookup".to_string(),
                reason: "no rendezvous directory in this mode".to_string(),
            }
            .into()
        })
    }
}

/// STUN before the listener owns the socket; falls back to the local address
async fn discover_public_addr(config: &MessengerConfig, transport: &Transport, local_ip: IpAddr) -> SocketAddr {
    let fallback = SocketAddr::new(local_ip, transport.port());
    if !config.rendezvous.enable_stun {
        return fallback;
    }
    let client = StunClient::new(
        config.rendezvous.stun_server.as_str(),
        Duration::from_millis(config.rendezvous.stun_timeout_ms),
    );
    match client.query(transport.socket()).await {
        Ok(public) => public,
        Err(e) => {
            log::warn!("STUN failed, using {} as public address: {}", fallback, e);
            fallback
        }
    }
}
