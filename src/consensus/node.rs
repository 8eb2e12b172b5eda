//! Core raft node wrapper.
//!
//! Wraps the raft library's `RawNode` together with its in-memory log
//! storage, the on-disk journal and the cache FSM, exposing the narrow
//! surface the runtime event loop needs: propose, step, tick, and a
//! ready-processing routine that persists, applies and collects outbound
//! messages in the order the library requires.

use prost::Message as _;
use raft::prelude::{ConfChange, ConfChangeType, Config, Entry, EntryType, Message, RawNode};
use raft::storage::MemStorage;
use raft::StateRole;
use slog::o;
use tracing::{error, info, warn};

use crate::consensus::fsm::CacheFsm;
use crate::consensus::journal::{Journal, RecoveredState};
use crate::error::{CacheError, Result};

/// Raft logical clock interval. Ticks drive heartbeat (3 ticks) and
/// election (10 ticks) timeouts.
pub const TICK_INTERVAL_MS: u64 = 100;

/// Outcome of applying one committed entry.
pub enum Applied {
    /// A normal command ran through the FSM.
    Command {
        proposal: Option<u64>,
        result: Result<()>,
    },
    /// A membership change was applied.
    Membership {
        proposal: Option<u64>,
        node_id: u64,
        addr: Option<String>,
        removed: bool,
    },
}

/// Everything one `Ready` round produced.
#[derive(Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<Applied>,
    /// (token, read index) pairs for resolved ReadIndex requests.
    pub read_states: Vec<(u64, u64)>,
}

pub struct RaftCore {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    fsm: CacheFsm,
    applied: u64,
}

impl RaftCore {
    /// Builds the raft node from recovered journal state.
    ///
    /// `applied` is the log index covered by the snapshot the FSM was
    /// restored from; committed entries beyond it re-apply on the first
    /// ready round.
    pub fn new(id: u64, fsm: CacheFsm, recovered: RecoveredState, applied: u64) -> Result<Self> {
        let storage = MemStorage::new();
        {
            let mut core = storage.wl();
            if let Some(cs) = recovered.conf_state.clone() {
                core.set_conf_state(cs);
            }
            if let Some(hs) = recovered.hard_state.clone() {
                core.set_hardstate(hs);
            }
            if !recovered.entries.is_empty() {
                core.append(&recovered.entries).map_err(raft_err)?;
            }
        }

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            applied,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let logger = slog::Logger::root(slog::Discard, o!());
        let raw = RawNode::new(&cfg, storage.clone(), &logger).map_err(raft_err)?;

        info!(
            "Raft node {} initialized (log entries: {}, applied: {})",
            id,
            recovered.entries.len(),
            applied
        );

        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            applied,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().map_err(raft_err)
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).map_err(raft_err)
    }

    /// Proposes a command, tagging the entry with the proposal id so the
    /// runtime can acknowledge the waiting caller when it applies.
    pub fn propose(&mut self, proposal: u64, data: Vec<u8>) -> Result<()> {
        self.raw
            .propose(proposal.to_be_bytes().to_vec(), data)
            .map_err(raft_err)
    }

    /// Proposes admitting `node_id` as a voter; the advertised address rides
    /// in the conf-change context so every member learns it from the log.
    pub fn propose_add_voter(&mut self, proposal: u64, node_id: u64, addr: &str) -> Result<()> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = node_id;
        cc.context = addr.as_bytes().to_vec().into();
        self.raw
            .propose_conf_change(proposal.to_be_bytes().to_vec(), cc)
            .map_err(raft_err)
    }

    /// Starts a ReadIndex round identified by `token`.
    pub fn read_index(&mut self, token: u64) {
        self.raw.read_index(token.to_be_bytes().to_vec());
    }

    /// Drains one ready round, if any.
    ///
    /// Ordering follows the library contract: persist hard state and new
    /// entries (journal first, then the in-memory log), collect outbound
    /// messages, apply committed entries through the FSM, then advance.
    pub fn poll_ready(&mut self, journal: &mut Journal) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();

        if let Some(hs) = ready.hs() {
            journal.append_hard_state(hs)?;
            self.storage.wl().set_hardstate(hs.clone());
        }

        if !ready.entries().is_empty() {
            journal.append_entries(ready.entries())?;
            self.storage.wl().append(ready.entries()).map_err(raft_err)?;
        }

        // The journal is never compacted, so peers are always caught up from
        // the log itself and snapshot transfer stays a cold path.
        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let snap_index = snapshot.get_metadata().index;
            warn!("Applying raft snapshot at index {}", snap_index);
            if !snapshot.data.is_empty() {
                let mut reader = &snapshot.data[..];
                self.fsm.restore(&mut reader)?;
            }
            self.storage
                .wl()
                .apply_snapshot(snapshot)
                .map_err(raft_err)?;
            self.applied = snap_index;
        }

        for rs in ready.take_read_states() {
            if let Some(token) = decode_token(&rs.request_ctx) {
                bundle.read_states.push((token, rs.index));
            }
        }

        let committed = ready.take_committed_entries();
        self.apply_entries(committed, journal, &mut bundle)?;
        bundle.messages.extend(ready.take_messages());
        bundle.messages.extend(ready.take_persisted_messages());

        journal.sync()?;

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        let committed = light.take_committed_entries();
        self.apply_entries(committed, journal, &mut bundle)?;
        bundle.messages.extend(light.take_messages());
        self.raw.advance_apply();

        Ok(Some(bundle))
    }

    fn apply_entries(
        &mut self,
        entries: Vec<Entry>,
        journal: &mut Journal,
        bundle: &mut ReadyBundle,
    ) -> Result<()> {
        for entry in entries {
            self.applied = entry.index;
            if entry.data.is_empty() {
                // Leader no-op entry appended on election.
                continue;
            }

            match entry.entry_type() {
                EntryType::EntryNormal => {
                    let result = self.fsm.apply(&entry.data);
                    if let Err(e) = &result {
                        error!("Apply failed at index {}: {}", entry.index, e);
                    }
                    bundle.applied.push(Applied::Command {
                        proposal: decode_token(&entry.context),
                        result,
                    });
                }
                EntryType::EntryConfChange => {
                    let Ok(cc) = ConfChange::decode(&entry.data[..]) else {
                        error!("Undecodable conf change at index {}", entry.index);
                        continue;
                    };
                    // A redundant change (e.g. re-adding a voter) must not
                    // take the node down; membership simply stays as-is.
                    match self.raw.apply_conf_change(&cc) {
                        Ok(cs) => {
                            journal.append_conf_state(&cs)?;
                            self.storage.wl().set_conf_state(cs);
                        }
                        Err(e) => {
                            warn!("Conf change at index {} not applied: {}", entry.index, e);
                        }
                    }

                    let removed = cc.change_type() == ConfChangeType::RemoveNode;
                    let addr = if cc.context.is_empty() {
                        None
                    } else {
                        String::from_utf8(cc.context.to_vec()).ok()
                    };
                    info!(
                        "Membership change applied: node {} {}",
                        cc.node_id,
                        if removed { "removed" } else { "added" }
                    );
                    bundle.applied.push(Applied::Membership {
                        proposal: decode_token(&entry.context),
                        node_id: cc.node_id,
                        addr,
                        removed,
                    });
                }
                _ => {
                    warn!("Skipping unsupported entry type at index {}", entry.index);
                }
            }
        }
        Ok(())
    }
}

/// Extracts the proposal token an entry context carries, if any.
pub(crate) fn decode_token(context: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = context.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Maps library errors onto the crate error; a dropped proposal means this
/// node is not the leader.
fn raft_err(e: raft::Error) -> CacheError {
    match e {
        raft::Error::ProposalDropped => CacheError::NotLeader,
        other => CacheError::Internal(other.to_string()),
    }
}
