//! Username directory used for internet rendezvous.
//!
//! A dedicated worker task owns the directory backend. Everything else talks
//! to it through a [`DirectoryHandle`]: publishes are fire-and-forget and
//! lookups answer on a oneshot channel, so no caller ever blocks on the DHT.
//!
//! Two backends answer the same requests:
//! - a libp2p Kademlia swarm (TCP + noise + yamux, in-memory record store)
//! - [`MemoryDirectory`], a process-local map for tests and single-host use

use crate::utils::{NetworkError, RendezvousConfig, Result};
use futures::StreamExt;
use libp2p::{
    kad::{self, store::MemoryStore, GetRecordOk, QueryId, QueryResult, Quorum, Record, RecordKey},
    multiaddr::Protocol,
    noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Value published under a username
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Address on the publisher's own network
    pub local_ip: IpAddr,
    /// `[ip, port]` learned through STUN, or null
    pub public_addr: Option<(IpAddr, u16)>,
    /// Port the publisher's socket is bound to, when it differs from the
    /// public mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listening_port: Option<u16>,
}

impl DirectoryRecord {
    /// Build a record from socket addresses
    pub fn new(local_ip: IpAddr, public_addr: Option<SocketAddr>, listening_port: u16) -> Self {
        Self {
            local_ip,
            public_addr: public_addr.map(|addr| (addr.ip(), addr.port())),
            listening_port: Some(listening_port),
        }
    }

    /// Public address as a socket address
    pub fn public_socket_addr(&self) -> Option<SocketAddr> {
        self.public_addr.map(|(ip, port)| SocketAddr::new(ip, port))
    }

    /// Best guess at the port behind `local_ip`
    pub fn local_port(&self) -> u16 {
        self.listening_port
            .or_else(|| self.public_addr.map(|(_, port)| port))
            .unwrap_or(crate::defaults::BASE_PORT)
    }

    /// JSON encoding stored in the directory
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Decode a stored value
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }
}

/// Requests served by the directory worker
#[derive(Debug)]
pub enum DirectoryRequest {
    /// Store our record under our username
    Publish {
        /// Key
        username: String,
        /// Value
        record: DirectoryRecord,
    },
    /// Resolve a username
    Lookup {
        /// Key
        username: String,
        /// Receives the record, or `None` if nothing was found
        reply: oneshot::Sender<Option<DirectoryRecord>>,
    },
}

/// Cheap, cloneable access to the directory worker
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    requests: mpsc::UnboundedSender<DirectoryRequest>,
}

impl DirectoryHandle {
    /// Start a Kademlia worker joined through the configured bootstrap nodes
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::DhtFailure` if the swarm cannot be built or
    /// cannot listen
    pub fn spawn_kademlia(
        config: &RendezvousConfig,
        stop: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let worker = KademliaWorker::new(config)?;
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(worker.run(rx, stop));
        Ok((Self { requests }, task))
    }

    /// Start a worker over a process-local directory
    pub fn spawn_memory(
        directory: MemoryDirectory,
        stop: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(directory.run(rx, stop));
        (Self { requests }, task)
    }

    /// Publish (or republish) a record
    pub fn publish(&self, username: &str, record: DirectoryRecord) -> Result<()> {
        self.submit(DirectoryRequest::Publish {
            username: username.to_string(),
            record,
        })
    }

    /// Start a lookup; the answer arrives on the returned receiver
    pub fn lookup(&self, username: &str) -> Result<oneshot::Receiver<Option<DirectoryRecord>>> {
        let (reply, answer) = oneshot::channel();
        self.submit(DirectoryRequest::Lookup {
            username: username.to_string(),
            reply,
        })?;
        Ok(answer)
    }

    fn submit(&self, request: DirectoryRequest) -> Result<()> {
        self.requests.send(request).map_err(|_| {
            NetworkError::DhtFailure {
                operation: "submit".to_string(),
                reason: "directory worker has stopped".to_string(),
            }
            .into()
        })
    }
}

/// Process-local directory; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    records: Arc<Mutex<HashMap<String, DirectoryRecord>>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record directly
    pub async fn get(&self, username: &str) -> Option<DirectoryRecord> {
        self.records.lock().await.get(username).cloned()
    }

    async fn run(self, mut requests: mpsc::UnboundedReceiver<DirectoryRequest>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(DirectoryRequest::Publish { username, record }) => {
                        log::debug!("Directory: publish {}", username);
                        self.records.lock().await.insert(username, record);
                    }
                    Some(DirectoryRequest::Lookup { username, reply }) => {
                        let found = self.get(&username).await;
                        let _ = reply.send(found);
                    }
                    None => break,
                },
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }
    }
}

type PendingLookup = (String, oneshot::Sender<Option<DirectoryRecord>>);

struct KademliaWorker {
    swarm: Swarm<kad::Behaviour<MemoryStore>>,
    pending: HashMap<QueryId, PendingLookup>,
}

fn dht_error(operation: &str, reason: impl ToString) -> crate::MessengerError {
    NetworkError::DhtFailure {
        operation: operation.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Extract the `/p2p/<peer id>` component of a multiaddress
pub fn extract_peer_id_from_addr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

impl KademliaWorker {
    fn new(config: &RendezvousConfig) -> Result<Self> {
        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| dht_error("build", e))?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                kad::Behaviour::new(peer_id, MemoryStore::new(peer_id))
            })
            .map_err(|e| dht_error("build", e))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        swarm.behaviour_mut().set_mode(Some(kad::Mode::Server));

        let listen: Multiaddr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(config.dht_listen_port));
        swarm
            .listen_on(listen)
            .map_err(|e| dht_error("listen", e))?;

        let mut bootstrap_peers = 0;
        for node in &config.bootstrap_nodes {
            let Ok(addr) = node.parse::<Multiaddr>() else {
                log::warn!("Ignoring malformed bootstrap address {}", node);
                continue;
            };
            match extract_peer_id_from_addr(&addr) {
                Some(peer_id) => {
                    swarm.behaviour_mut().add_address(&peer_id, addr);
                    bootstrap_peers += 1;
                }
                None => log::warn!("Bootstrap address {} has no /p2p/ peer id", node),
            }
        }

        if bootstrap_peers > 0 {
            if let Err(e) = swarm.behaviour_mut().bootstrap() {
                log::warn!("DHT bootstrap failed: {}", e);
            }
        } else {
            log::warn!("No DHT bootstrap nodes; directory limited to this node");
        }

        log::info!("DHT node {} started", swarm.local_peer_id());

        Ok(Self {
            swarm,
            pending: HashMap::new(),
        })
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<DirectoryRequest>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }
        log::debug!("DHT worker stopped");
    }

    fn handle_request(&mut self, request: DirectoryRequest) {
        match request {
            DirectoryRequest::Publish { username, record } => {
                let value = match record.to_json() {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("Cannot encode directory record: {}", e);
                        return;
                    }
                };
                let record = Record::new(RecordKey::new(&username.as_bytes()), value);
                match self.swarm.behaviour_mut().put_record(record, Quorum::One) {
                    Ok(_) => log::debug!("DHT: publishing {}", username),
                    Err(e) => log::warn!("DHT: put {} failed: {:?}", username, e),
                }
            }
            DirectoryRequest::Lookup { username, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .get_record(RecordKey::new(&username.as_bytes()));
                self.pending.insert(id, (username, reply));
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<kad::Event>) {
        match event {
            SwarmEvent::Behaviour(kad::Event::OutboundQueryProgressed { id, result, .. }) => {
                self.handle_query_result(id, result);
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("DHT listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                log::debug!("DHT connected to {}", peer_id);
            }
            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: QueryId, result: QueryResult) {
        match result {
            QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(peer_record))) => {
                if let Some((username, reply)) = self.pending.remove(&id) {
                    match DirectoryRecord::from_json(&peer_record.record.value) {
                        Ok(record) => {
                            log::info!("DHT: found {}", username);
                            let _ = reply.send(Some(record));
                        }
                        Err(e) => {
                            log::warn!("DHT: bad record for {}: {}", username, e);
                            let _ = reply.send(None);
                        }
                    }
                }
            }
            QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord { .. })) => {
                if let Some((_, reply)) = self.pending.remove(&id) {
                    let _ = reply.send(None);
                }
            }
            QueryResult::GetRecord(Err(e)) => {
                if let Some((username, reply)) = self.pending.remove(&id) {
                    log::debug!("DHT: lookup of {} failed: {:?}", username, e);
                    let _ = reply.send(None);
                }
            }
            QueryResult::PutRecord(Ok(_)) => log::debug!("DHT: record stored"),
            QueryResult::PutRecord(Err(e)) => log::debug!("DHT: put incomplete: {:?}", e),
            QueryResult::Bootstrap(Ok(ok)) => {
                log::debug!("DHT bootstrap step, {} remaining", ok.num_remaining);
            }
            QueryResult::Bootstrap(Err(e)) => log::warn!("DHT bootstrap failed: {:?}", e),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DirectoryRecord {
        DirectoryRecord::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            Some("203.0.113.9:40001".parse().unwrap()),
            40001,
        )
    }

    #[test]
    fn test_record_json_contract() {
        let value: serde_json::Value = serde_json::from_slice(&record().to_json().unwrap()).unwrap();
        assert_eq!(value["local_ip"], "192.168.1.20");
        assert_eq!(value["public_addr"][0], "203.0.113.9");
        assert_eq!(value["public_addr"][1], 40001);

        let bare: DirectoryRecord =
            serde_json::from_str(r#"{"local_ip":"10.0.0.2","public_addr":null}"#).unwrap();
        assert_eq!(bare.public_socket_addr(), None);
        assert_eq!(bare.local_port(), crate::defaults::BASE_PORT);
    }

    #[test]
    fn test_extract_peer_id() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}").parse().unwrap();
        assert_eq!(extract_peer_id_from_addr(&addr), Some(peer_id));

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(extract_peer_id_from_addr(&bare), None);
    }

    #[tokio::test]
    async fn test_memory_directory_roundtrip() {
        let (_stop_tx, stop) = watch::channel(false);
        let shared = MemoryDirectory::new();
        let (alice, _) = DirectoryHandle::spawn_memory(shared.clone(), stop.clone());
        let (bob, _) = DirectoryHandle::spawn_memory(shared.clone(), stop);

        alice.publish("alice", record()).unwrap();
        // Publishing is asynchronous; wait for the worker to apply it
        while shared.get("alice").await.is_none() {
            tokio::task::yield_now().await;
        }

        assert_eq!(bob.lookup("alice").unwrap().await.unwrap(), Some(record()));
        assert_eq!(bob.lookup("mallory").unwrap().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_requests() {
        let (stop_tx, stop) = watch::channel(false);
        let (handle, task) = DirectoryHandle::spawn_memory(MemoryDirectory::new(), stop);

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let err = handle.lookup("alice").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_kademlia_worker_without_peers() {
        let (_stop_tx, stop) = watch::channel(false);
        let config = RendezvousConfig::default();
        let (handle, _) = DirectoryHandle::spawn_kademlia(&config, stop).unwrap();

        // With no peers the query finishes empty instead of hanging
        let answer = tokio::time::timeout(Duration::from_secs(10), handle.lookup("nobody").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, None);
    }
}
