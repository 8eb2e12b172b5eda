//! Snapshot store.
//!
//! A directory of numbered snapshot files under the node's data directory.
//! Writes go to a temporary file first and are renamed into place on close,
//! so a crash or a cancelled sink never leaves a half-written snapshot
//! visible. The two most recent snapshots are retained.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;

const SNAPSHOT_DIR: &str = "snapshots";
const RETAIN: usize = 2;

/// Manages the snapshot directory for one node.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        let dir = data_dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Starts a new snapshot at the given log position.
    pub fn create(&self, index: u64, term: u64) -> io::Result<SnapshotSink> {
        let final_path = self.dir.join(format!("snapshot-{:020}-{}.bin", index, term));
        let tmp_path = self.dir.join(format!("tmp-{:020}-{}.bin", index, term));
        let file = File::create(&tmp_path)?;
        Ok(SnapshotSink {
            writer: Some(BufWriter::new(file)),
            tmp_path,
            final_path,
            dir: self.dir.clone(),
        })
    }

    /// Returns (index, term, path) of the most recent complete snapshot.
    pub fn latest(&self) -> io::Result<Option<(u64, u64, PathBuf)>> {
        Ok(self.list()?.into_iter().last())
    }

    fn list(&self) -> io::Result<Vec<(u64, u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(meta) = parse_snapshot_name(&name) {
                found.push((meta.0, meta.1, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }

    fn prune(&self) {
        let Ok(mut snapshots) = self.list() else {
            return;
        };
        while snapshots.len() > RETAIN {
            let (index, _, path) = snapshots.remove(0);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to prune snapshot at index {}: {}", index, e);
            }
        }
    }
}

fn parse_snapshot_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix("snapshot-")?.strip_suffix(".bin")?;
    let (index, term) = rest.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

/// Write sink for one in-flight snapshot.
pub struct SnapshotSink {
    writer: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    dir: PathBuf,
}

impl SnapshotSink {
    /// Publishes the snapshot and prunes old ones.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        info!("Snapshot persisted to {}", self.final_path.display());
        let store = SnapshotStore {
            dir: self.dir.clone(),
        };
        store.prune();
        Ok(())
    }

    /// Discards the partial snapshot.
    pub fn cancel(mut self) {
        self.writer.take();
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            warn!("Failed to remove cancelled snapshot: {}", e);
        }
    }
}

impl Write for SnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "sink closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotSink {
    fn drop(&mut self) {
        // An abandoned sink leaves only a tmp file, which the next create
        // with the same position overwrites.
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
