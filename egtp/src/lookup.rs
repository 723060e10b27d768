//! Address lookup and relay discovery.
//!
//! The node only needs two narrow services from the outside world: somewhere to publish its address record and find
//! other nodes' records, and a source of relayers. [`Directory`] implements both in memory. It is shared between
//! clones, so several nodes in one process can use it as their common address book, and it can be seeded from a YAML
//! file.

use crate::identity::PeerId;
use crate::strategy::AddressRecord;
use async_trait::async_trait;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("No address record found for {0}")]
    NotFound(PeerId),
    #[error("The lookup is taking longer than expected")]
    SoftTimeout,
    #[error("Lookup failed. {0}")]
    Failed(String),
}

#[async_trait]
pub trait Lookup: Send + Sync {
    async fn publish(&self, id: PeerId, record: AddressRecord) -> Result<(), LookupError>;
    async fn lookup(&self, id: PeerId) -> Result<AddressRecord, LookupError>;
}

#[async_trait]
pub trait RelayDiscovery: Send + Sync {
    async fn discover_relays(&self) -> Result<Vec<PeerId>, LookupError>;
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryContents {
    pub records: HashMap<PeerId, AddressRecord>,
    pub relayers: Vec<PeerId>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid directory file: {0}")]
    InvalidFile(#[from] serde_yml::Error),
}

#[derive(Clone, Default)]
pub struct Directory {
    contents: Arc<Mutex<DirectoryContents>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let contents: DirectoryContents = serde_yml::from_reader(reader)?;
        debug!("Loaded directory with {} records and {} relayers", contents.records.len(), contents.relayers.len());
        Ok(Directory { contents: Arc::new(Mutex::new(contents)) })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DirectoryError> {
        let contents = self.snapshot();
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yml::to_writer(writer, &contents)?;
        Ok(())
    }

    pub fn snapshot(&self) -> DirectoryContents {
        self.with_contents(|c| c.clone())
    }

    pub fn add_relayer(&self, id: PeerId) {
        self.with_contents(|c| {
            if !c.relayers.contains(&id) {
                c.relayers.push(id);
            }
        })
    }

    pub fn insert(&self, id: PeerId, record: AddressRecord) {
        self.with_contents(|c| c.records.insert(id, record));
    }

    pub fn get(&self, id: &PeerId) -> Option<AddressRecord> {
        self.with_contents(|c| c.records.get(id).cloned())
    }

    // A panic while holding the lock leaves plain data behind, so a poisoned lock is still usable.
    fn with_contents<R>(&self, f: impl FnOnce(&mut DirectoryContents) -> R) -> R {
        let mut guard = self.contents.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl Lookup for Directory {
    async fn publish(&self, id: PeerId, record: AddressRecord) -> Result<(), LookupError> {
        if let Some(owner) = record.peer_id().filter(|owner| *owner != id) {
            return Err(LookupError::Failed(format!("record for {owner} published as {id}")));
        }
        let seqno = record.sequence_number();
        let newer = self.with_contents(|c| {
            let stale = c.records.get(&id).is_some_and(|old| old.sequence_number() > seqno);
            if !stale {
                c.records.insert(id, record);
            }
            !stale
        });
        if newer {
            debug!("Published address record for {id} (seqno {seqno:?})");
        } else {
            debug!("Ignored stale address record for {id} (seqno {seqno:?})");
        }
        Ok(())
    }

    async fn lookup(&self, id: PeerId) -> Result<AddressRecord, LookupError> {
        self.get(&id).ok_or(LookupError::NotFound(id))
    }
}

#[async_trait]
impl RelayDiscovery for Directory {
    async fn discover_relays(&self) -> Result<Vec<PeerId>, LookupError> {
        Ok(self.with_contents(|c| c.relayers.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::strategy::{CommStrategy, TcpStrategy};
    use tempfile::TempPath;

    fn record(seqno: i64) -> AddressRecord {
        AddressRecord::new(&CommStrategy::Tcp(TcpStrategy::to_address("10.1.1.1", 2000, None, Some(seqno))))
    }

    #[tokio::test]
    async fn publish_and_lookup() {
        let directory = Directory::new();
        let shared = directory.clone();
        let id = PeerId::digest(b"node");
        assert_eq!(directory.lookup(id).await, Err(LookupError::NotFound(id)));
        shared.publish(id, record(2)).await.expect("publish");
        assert_eq!(directory.lookup(id).await, Ok(record(2)));
        shared.publish(id, record(1)).await.expect("publish");
        assert_eq!(directory.lookup(id).await, Ok(record(2)), "older records do not replace newer ones");
        shared.publish(id, record(3)).await.expect("publish");
        assert_eq!(directory.lookup(id).await, Ok(record(3)));
    }

    #[tokio::test]
    async fn relayers_and_persistence() {
        let directory = Directory::new();
        let relayer = PeerId::digest(b"relayer");
        directory.add_relayer(relayer);
        directory.add_relayer(relayer);
        directory.insert(PeerId::digest(b"node"), record(7));
        assert_eq!(directory.discover_relays().await, Ok(vec![relayer]));

        let tmp = TempPath::from_path("test_egtp_directory.yml");
        directory.save(&tmp).expect("save directory");
        let loaded = Directory::load(&tmp).expect("load directory");
        assert_eq!(loaded.snapshot(), directory.snapshot());
    }
}
