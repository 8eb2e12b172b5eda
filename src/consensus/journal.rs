//! On-disk consensus journal.
//!
//! An append-only record log under the node's data directory holding raft
//! log entries, hard-state updates and configuration-state updates as
//! length-prefixed bincode frames. On startup the whole file is replayed to
//! rebuild the in-memory raft storage; the state machine itself is restored
//! from the latest snapshot so only the suffix of the log re-applies.
//!
//! The journal is never truncated: snapshots bound state machine replay,
//! not log size, which keeps the full log available for replicating to
//! newly joined members.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use raft::prelude::{ConfState, Entry, EntryType, HardState};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

const JOURNAL_FILE: &str = "journal.log";

#[derive(Debug, Serialize, Deserialize)]
enum Record {
    Entry {
        index: u64,
        term: u64,
        conf_change: bool,
        context: Vec<u8>,
        data: Vec<u8>,
    },
    HardState {
        term: u64,
        vote: u64,
        commit: u64,
    },
    ConfState {
        voters: Vec<u64>,
        learners: Vec<u64>,
    },
}

/// State recovered from an existing journal.
#[derive(Default)]
pub struct RecoveredState {
    pub entries: Vec<Entry>,
    pub hard_state: Option<HardState>,
    pub conf_state: Option<ConfState>,
}

impl RecoveredState {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.hard_state.is_none() && self.conf_state.is_none()
    }
}

/// Append-side handle to the journal file.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    /// Opens (or creates) the journal, replaying existing records first.
    pub fn open(data_dir: &Path) -> Result<(Self, RecoveredState)> {
        let path = data_dir.join(JOURNAL_FILE);
        let mut state = RecoveredState::default();

        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            loop {
                match read_record(&mut reader) {
                    Ok(Some(record)) => apply_record(&mut state, record),
                    Ok(None) => break,
                    Err(e) => {
                        // A torn tail from a crash mid-append: stop at the
                        // last complete record.
                        warn!("Journal replay stopped early: {}", e);
                        break;
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((
            Self {
                writer: BufWriter::new(file),
                path,
            },
            state,
        ))
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.append(&Record::Entry {
                index: entry.index,
                term: entry.term,
                conf_change: entry.entry_type() != EntryType::EntryNormal,
                context: entry.context.to_vec(),
                data: entry.data.to_vec(),
            })?;
        }
        Ok(())
    }

    pub fn append_hard_state(&mut self, hs: &HardState) -> Result<()> {
        self.append(&Record::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        })
    }

    pub fn append_conf_state(&mut self, cs: &ConfState) -> Result<()> {
        self.append(&Record::ConfState {
            voters: cs.voters.clone(),
            learners: cs.learners.clone(),
        })
    }

    /// Flushes buffered records to the OS. Called once per ready batch.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let frame = bincode::serialize(record)?;
        self.writer.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.writer.write_all(&frame)?;
        Ok(())
    }
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(Some(bincode::deserialize(&frame)?))
}

fn apply_record(state: &mut RecoveredState, record: Record) {
    match record {
        Record::Entry {
            index,
            term,
            conf_change,
            context,
            data,
        } => {
            // A re-appended index means the raft log truncated a conflicting
            // suffix; drop everything from that index on before pushing.
            if let Some(first) = state.entries.first().map(|e| e.index) {
                if index >= first {
                    state.entries.truncate((index - first) as usize);
                }
            }
            let mut entry = Entry::default();
            entry.set_entry_type(if conf_change {
                EntryType::EntryConfChange
            } else {
                EntryType::EntryNormal
            });
            entry.index = index;
            entry.term = term;
            entry.context = context.into();
            entry.data = data.into();
            state.entries.push(entry);
        }
        Record::HardState { term, vote, commit } => {
            let mut hs = HardState::default();
            hs.term = term;
            hs.vote = vote;
            hs.commit = commit;
            state.hard_state = Some(hs);
        }
        Record::ConfState { voters, learners } => {
            state.conf_state = Some(ConfState::from((voters, learners)));
        }
    }
}
