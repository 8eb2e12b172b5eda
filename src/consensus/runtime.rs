//! Consensus runtime and facade.
//!
//! A single tokio task owns the raft core and processes three event
//! sources: facade requests from the gateway, raft messages from peers, and
//! the 100 ms logical-clock tick. Keeping the core single-owner means no
//! locks around raft state.
//!
//! The [`RaftHandle`] facade is what the rest of the node sees: submit with
//! a bounded wait, ReadIndex-backed leader verification, voter admission and
//! a non-authoritative status snapshot. The consensus library itself stays
//! hidden behind it.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use raft::prelude::{ConfState, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::consensus::fsm::CacheFsm;
use crate::consensus::journal::Journal;
use crate::consensus::node::{Applied, RaftCore, TICK_INTERVAL_MS};
use crate::consensus::snapshots::SnapshotStore;
use crate::error::{CacheError, Result};
use crate::transport;

/// Shared registry of peer advertise addresses, fed both by applied
/// membership changes and by inbound message envelopes.
pub type PeerRegistry = Arc<DashMap<u64, String>>;

/// How long `submit` waits for local apply before reporting a timeout.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Default deadline for a leader-verification round.
pub const VERIFY_TIMEOUT: Duration = Duration::from_millis(500);
/// Conf changes ride through leader election and replication; give them
/// more room than plain writes.
const ADD_VOTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime construction parameters.
pub struct RaftConfig {
    pub id: u64,
    pub advertise_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    pub snapshot_threshold: u64,
    pub verify_timeout: Duration,
}

/// Local view of the raft state.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: u64,
    pub leader_id: u64,
    pub term: u64,
    pub is_leader: bool,
    pub applied: u64,
}

enum Request {
    Submit {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    AddVoter {
        node_id: u64,
        addr: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    VerifyLeader {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Status {
        respond_to: oneshot::Sender<RaftStatus>,
    },
    Shutdown,
}

/// Cloneable handle to a running consensus runtime.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Request>,
    verify_timeout: Duration,
}

impl RaftHandle {
    /// Submits an encoded command to the log, returning once the entry has
    /// been committed and applied locally, bounded by [`SUBMIT_TIMEOUT`].
    ///
    /// A timeout is ambiguous: the write may still commit after the caller
    /// gives up.
    pub async fn submit(&self, data: Vec<u8>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Submit { data, respond_to }).await?;
        await_reply(rx, SUBMIT_TIMEOUT).await
    }

    /// Confirms this node still holds leadership via a ReadIndex round with
    /// a majority. Used to gate linearizable reads.
    pub async fn verify_leader(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::VerifyLeader { respond_to }).await?;
        await_reply(rx, self.verify_timeout).await
    }

    /// Proposes a configuration change admitting a new voting member.
    pub async fn add_voter(&self, node_id: u64, addr: &str) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::AddVoter {
            node_id,
            addr: addr.to_string(),
            respond_to,
        })
        .await?;
        await_reply(rx, ADD_VOTER_TIMEOUT).await
    }

    /// Non-authoritative snapshot of local raft belief.
    pub async fn status(&self) -> Result<RaftStatus> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Request::Status { respond_to }).await?;
        rx.await.map_err(|_| CacheError::Shutdown)
    }

    pub async fn is_leader(&self) -> bool {
        self.status().await.map(|s| s.is_leader).unwrap_or(false)
    }

    /// Asks the runtime to stop. Outstanding requests fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }

    async fn send(&self, req: Request) -> Result<()> {
        self.tx.send(req).await.map_err(|_| CacheError::Shutdown)
    }
}

async fn await_reply(rx: oneshot::Receiver<Result<()>>, deadline: Duration) -> Result<()> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CacheError::Shutdown),
        Err(_) => Err(CacheError::Timeout),
    }
}

/// Recovers persisted state, builds the raft core and spawns the runtime.
pub fn spawn(
    config: RaftConfig,
    fsm: CacheFsm,
    peers: PeerRegistry,
    incoming: mpsc::Receiver<Message>,
) -> Result<RaftHandle> {
    std::fs::create_dir_all(&config.data_dir)?;
    let snapshots = SnapshotStore::open(&config.data_dir)?;
    let (mut journal, mut recovered) = Journal::open(&config.data_dir)?;

    let mut applied = 0;
    if let Some((index, term, path)) = snapshots.latest()? {
        let mut reader = BufReader::new(File::open(&path)?);
        fsm.restore(&mut reader)?;
        applied = index;
        info!(
            "Restored state machine from snapshot at index {} (term {})",
            index, term
        );
    }

    // A snapshot can only cover entries the journal still has; with a lost
    // or truncated journal the state machine keeps its restored contents and
    // raft replays from whatever log remains (re-applies are idempotent).
    let last_index = recovered.entries.last().map(|e| e.index).unwrap_or(0);
    let applied = applied.min(last_index);

    // Commit advancement through light-ready rounds is not journaled, so the
    // recorded commit may trail the snapshot; anything the snapshot covers
    // was by definition committed.
    if let Some(hs) = recovered.hard_state.as_mut() {
        if hs.commit < applied {
            hs.commit = applied;
        }
    }

    if config.bootstrap && recovered.is_empty() {
        info!("Bootstrapping new single-node cluster (id {})", config.id);
        let cs = ConfState::from((vec![config.id], vec![]));
        journal.append_conf_state(&cs)?;
        journal.sync()?;
        recovered.conf_state = Some(cs);
    }

    // Seed peer addresses from membership entries already in the log, and
    // start proposal tokens past everything the log already carries so a
    // replayed entry can never acknowledge a fresh proposal.
    let mut next_token = 1;
    for entry in &recovered.entries {
        seed_peer_from_entry(&peers, entry);
        if let Some(token) = crate::consensus::node::decode_token(&entry.context) {
            next_token = next_token.max(token + 1);
        }
    }
    peers.insert(config.id, config.advertise_addr.clone());

    let mut core = RaftCore::new(config.id, fsm.clone(), recovered, applied)?;
    if config.bootstrap {
        // Single-voter clusters elect themselves immediately.
        if let Err(e) = core.campaign() {
            warn!("Initial campaign failed: {}", e);
        }
    }

    let (tx, rx) = mpsc::channel(256);
    let verify_timeout = config.verify_timeout;
    let worker = Worker {
        core,
        journal,
        snapshots,
        fsm,
        peers,
        advertise_addr: config.advertise_addr,
        snapshot_threshold: config.snapshot_threshold.max(1),
        requests: rx,
        incoming,
        pending: HashMap::new(),
        read_waiters: Vec::new(),
        next_token,
        applied_since_snapshot: 0,
        announced: false,
        was_leader: false,
    };
    tokio::spawn(worker.run());

    Ok(RaftHandle { tx, verify_timeout })
}

fn seed_peer_from_entry(peers: &PeerRegistry, entry: &raft::prelude::Entry) {
    use prost::Message as _;
    use raft::prelude::{ConfChange, EntryType};

    if entry.entry_type() != EntryType::EntryConfChange || entry.data.is_empty() {
        return;
    }
    if let Ok(cc) = ConfChange::decode(&entry.data[..]) {
        if !cc.context.is_empty() {
            if let Ok(addr) = String::from_utf8(cc.context.to_vec()) {
                peers.insert(cc.node_id, addr);
            }
        }
    }
}

struct ReadWaiter {
    token: u64,
    respond_to: oneshot::Sender<Result<()>>,
    /// Set once the ReadState arrives; resolved when applied catches up.
    index: Option<u64>,
}

struct Worker {
    core: RaftCore,
    journal: Journal,
    snapshots: SnapshotStore,
    fsm: CacheFsm,
    peers: PeerRegistry,
    advertise_addr: String,
    snapshot_threshold: u64,
    requests: mpsc::Receiver<Request>,
    incoming: mpsc::Receiver<Message>,
    /// Proposal id -> waiting submitter.
    pending: HashMap<u64, oneshot::Sender<Result<()>>>,
    read_waiters: Vec<ReadWaiter>,
    next_token: u64,
    applied_since_snapshot: u64,
    /// Whether this process has logged its own membership entry yet.
    announced: bool,
    was_leader: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_req = self.requests.recv() => {
                    match maybe_req {
                        Some(Request::Shutdown) | None => break,
                        Some(req) => self.handle_request(req),
                    }
                }
                maybe_msg = self.incoming.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if let Err(e) = self.core.step(msg) {
                                warn!("Failed to step raft message: {}", e);
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => self.core.tick(),
            }

            self.maybe_announce();
            if let Err(e) = self.process_ready() {
                // Journal failures are not survivable: losing the persisted
                // log would let this node vote against its own history.
                error!("Consensus runtime stopping on ready error: {}", e);
                break;
            }
            self.resolve_reads();
            self.handle_role_change();
            self.maybe_snapshot();
        }

        info!("Consensus runtime for node {} stopped", self.core.id());
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(CacheError::Shutdown));
        }
        for waiter in self.read_waiters.drain(..) {
            let _ = waiter.respond_to.send(Err(CacheError::Shutdown));
        }
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Submit { data, respond_to } => {
                if !self.core.is_leader() {
                    let _ = respond_to.send(Err(CacheError::NotLeader));
                    return;
                }
                let token = self.take_token();
                match self.core.propose(token, data) {
                    Ok(()) => {
                        self.pending.insert(token, respond_to);
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            Request::AddVoter {
                node_id,
                addr,
                respond_to,
            } => {
                if !self.core.is_leader() {
                    let _ = respond_to.send(Err(CacheError::NotLeader));
                    return;
                }
                // Register eagerly so replication to the newcomer can start
                // as soon as the change commits.
                self.peers.insert(node_id, addr.clone());
                let token = self.take_token();
                match self.core.propose_add_voter(token, node_id, &addr) {
                    Ok(()) => {
                        self.pending.insert(token, respond_to);
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e));
                    }
                }
            }
            Request::VerifyLeader { respond_to } => {
                if !self.core.is_leader() {
                    let _ = respond_to.send(Err(CacheError::NotLeader));
                    return;
                }
                let token = self.take_token();
                self.read_waiters.push(ReadWaiter {
                    token,
                    respond_to,
                    index: None,
                });
                self.core.read_index(token);
            }
            Request::Status { respond_to } => {
                let _ = respond_to.send(RaftStatus {
                    id: self.core.id(),
                    leader_id: self.core.leader_id(),
                    term: self.core.term(),
                    is_leader: self.core.is_leader(),
                    applied: self.core.applied(),
                });
            }
            Request::Shutdown => unreachable!("handled in the select loop"),
        }
    }

    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.core.poll_ready(&mut self.journal)? {
            for msg in bundle.messages {
                self.dispatch(msg);
            }
            for (token, index) in bundle.read_states {
                if let Some(waiter) = self.read_waiters.iter_mut().find(|w| w.token == token) {
                    waiter.index = Some(index);
                }
            }
            for applied in bundle.applied {
                self.handle_applied(applied);
            }
        }
        Ok(())
    }

    fn handle_applied(&mut self, applied: Applied) {
        self.applied_since_snapshot += 1;
        match applied {
            Applied::Command { proposal, result } => {
                if let Some(waiter) = proposal.and_then(|t| self.pending.remove(&t)) {
                    let _ = waiter.send(result);
                }
            }
            Applied::Membership {
                proposal,
                node_id,
                addr,
                removed,
            } => {
                if removed {
                    self.peers.remove(&node_id);
                } else if let Some(addr) = addr {
                    self.peers.insert(node_id, addr);
                }
                if let Some(waiter) = proposal.and_then(|t| self.pending.remove(&t)) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    fn dispatch(&mut self, msg: Message) {
        if msg.to == self.core.id() {
            if let Err(e) = self.core.step(msg) {
                warn!("Failed to step local message: {}", e);
            }
            return;
        }
        let Some(addr) = self.peers.get(&msg.to).map(|a| a.value().clone()) else {
            debug!("No address for peer {}, dropping message", msg.to);
            return;
        };
        transport::send_message(addr, self.advertise_addr.clone(), msg);
    }

    fn resolve_reads(&mut self) {
        let applied = self.core.applied();
        let mut remaining = Vec::with_capacity(self.read_waiters.len());
        for waiter in self.read_waiters.drain(..) {
            match waiter.index {
                Some(index) if applied >= index => {
                    let _ = waiter.respond_to.send(Ok(()));
                }
                _ => remaining.push(waiter),
            }
        }
        self.read_waiters = remaining;
    }

    /// On losing leadership, proposals in flight will never be acknowledged
    /// here; fail them so callers can redirect instead of waiting out their
    /// deadlines. A later re-election re-announces membership.
    fn handle_role_change(&mut self) {
        let is_leader = self.core.is_leader();
        if self.was_leader && !is_leader {
            info!("Lost leadership, failing {} pending proposal(s)", self.pending.len());
            for (_, waiter) in self.pending.drain() {
                let _ = waiter.send(Err(CacheError::NotLeader));
            }
            self.announced = false;
        }
        self.was_leader = is_leader;
    }

    /// Once per leadership, re-propose this node's own membership so the
    /// voter set (bootstrap configuration included) is recoverable from the
    /// log alone; a node that joins later replays it and learns every
    /// member and its address. Re-adding an existing voter is a no-op.
    fn maybe_announce(&mut self) {
        if self.announced || !self.core.is_leader() {
            return;
        }
        let token = self.take_token();
        let addr = self.advertise_addr.clone();
        let id = self.core.id();
        match self.core.propose_add_voter(token, id, &addr) {
            Ok(()) => self.announced = true,
            Err(e) => debug!("Membership self-announce deferred: {}", e),
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.applied_since_snapshot < self.snapshot_threshold {
            return;
        }
        self.applied_since_snapshot = 0;

        let index = self.core.applied();
        let term = self.core.term();
        let sink = match self.snapshots.create(index, term) {
            Ok(sink) => sink,
            Err(e) => {
                error!("Failed to start snapshot at index {}: {}", index, e);
                return;
            }
        };
        // A failed persist cancels the sink; the node itself carries on.
        match self.fsm.snapshot().persist(sink) {
            Ok(()) => info!("State machine snapshot taken at index {}", index),
            Err(e) => error!("Snapshot at index {} failed: {}", index, e),
        }
    }

    fn take_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }
}
