//! Persistent metadata store.
//!
//! [`MetaStore`] keeps three keyspaces in one RocksDB instance: the server
//! config scalars, the append-only commit log keyed by txnid, and the
//! applied key/value data. A magic number written on creation validates
//! the store on every open.
//!
//! [`StoreHandler`] implements the [`ActionHandler`] contract on top of a
//! shared store and routes responses back to the local request manager.

use crate::error::{CairnError, Result};
use crate::message::{LogEntry, Proposal, PROTOCOL_VERSION};
use crate::protocol::{ActionHandler, ClientRequestMgr};
use crate::types::{Epoch, Fid, OpCode, ReqId, Txnid};
use parking_lot::Mutex;
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const PREFIX_SERVER_CONFIG: &str = "/cairn/server/config/";
const PREFIX_COMMIT_LOG: &str = "/cairn/commitlog/";
const PREFIX_DATA: &str = "/cairn/data/";

const CONFIG_ACCEPTED_EPOCH: &str = "AcceptedEpoch";
const CONFIG_CURRENT_EPOCH: &str = "CurrentEpoch";
const CONFIG_LAST_LOGGED_TXID: &str = "LastLoggedTxid";
const CONFIG_LAST_COMMITTED_TXID: &str = "LastCommittedTxid";
const CONFIG_MAGIC: &str = "MagicNumber";

/// Sentinel validating the store on open.
const MAGIC_VALUE: u64 = 0x0123456789;

/// One record of the commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredEntry {
    opcode: u32,
    key: String,
    content: Vec<u8>,
}

/// Durable log, applied state, and config scalars for one peer.
pub struct MetaStore {
    db: DB,
    // Serializes read-check-write sequences across callers.
    write_lock: Mutex<()>,
}

impl MetaStore {
    /// Open or create a store at the given path. An existing store with a
    /// bad magic number is rejected as corrupt.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        let store = Self {
            db,
            write_lock: Mutex::new(()),
        };

        match store.get_scalar(CONFIG_MAGIC)? {
            None => {
                store.set_scalar(CONFIG_MAGIC, MAGIC_VALUE)?;
                info!("initialized fresh metadata store");
            }
            Some(MAGIC_VALUE) => {}
            Some(other) => {
                return Err(CairnError::CorruptStore(format!(
                    "bad magic number {:#x}",
                    other
                )))
            }
        }

        Ok(store)
    }

    fn config_key(name: &str) -> Vec<u8> {
        format!("{}{}", PREFIX_SERVER_CONFIG, name).into_bytes()
    }

    fn log_key(txnid: Txnid) -> Vec<u8> {
        let mut key = PREFIX_COMMIT_LOG.as_bytes().to_vec();
        key.extend_from_slice(&txnid.0.to_be_bytes());
        key
    }

    fn data_key(key: &str) -> Vec<u8> {
        format!("{}{}", PREFIX_DATA, key).into_bytes()
    }

    fn get_scalar(&self, name: &str) -> Result<Option<u64>> {
        match self.db.get(Self::config_key(name))? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    CairnError::CorruptStore(format!("config scalar {} malformed", name))
                })?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn set_scalar(&self, name: &str, value: u64) -> Result<()> {
        self.db.put(Self::config_key(name), value.to_be_bytes())?;
        Ok(())
    }

    pub fn last_logged_txid(&self) -> Result<Txnid> {
        Ok(Txnid(self.get_scalar(CONFIG_LAST_LOGGED_TXID)?.unwrap_or(0)))
    }

    pub fn last_committed_txid(&self) -> Result<Txnid> {
        Ok(Txnid(
            self.get_scalar(CONFIG_LAST_COMMITTED_TXID)?.unwrap_or(0),
        ))
    }

    pub fn accepted_epoch(&self) -> Result<Epoch> {
        Ok(self.get_scalar(CONFIG_ACCEPTED_EPOCH)?.unwrap_or(0) as Epoch)
    }

    pub fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        self.set_scalar(CONFIG_ACCEPTED_EPOCH, epoch as u64)
    }

    pub fn current_epoch(&self) -> Result<Epoch> {
        Ok(self.get_scalar(CONFIG_CURRENT_EPOCH)?.unwrap_or(0) as Epoch)
    }

    pub fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        self.set_scalar(CONFIG_CURRENT_EPOCH, epoch as u64)
    }

    /// Append a proposal to the commit log.
    ///
    /// Txnids are strictly increasing and gap-free on insert: within an
    /// epoch each entry follows its predecessor's counter, and an epoch
    /// change restarts the counter at one. A skipped txnid means a missed
    /// proposal and forces the peer back into synchronization. Re-logging
    /// an existing txnid with an identical payload is an idempotent no-op;
    /// a different payload is a conflict.
    pub fn log_proposal(&self, proposal: &Proposal) -> Result<()> {
        let _guard = self.write_lock.lock();

        let last = self.last_logged_txid()?;
        if proposal.txnid <= last {
            let existing = self.read_entry(proposal.txnid)?;
            return match existing {
                Some(entry)
                    if entry.opcode == proposal.opcode
                        && entry.key == proposal.key
                        && entry.content == proposal.content =>
                {
                    debug!(txnid = %proposal.txnid, "idempotent replay ignored");
                    Ok(())
                }
                _ => Err(CairnError::LogConflict {
                    txnid: proposal.txnid,
                }),
            };
        }
        if !follows(proposal.txnid, last) {
            return Err(CairnError::LogGap {
                txnid: proposal.txnid,
                last,
            });
        }

        let entry = StoredEntry {
            opcode: proposal.opcode,
            key: proposal.key.clone(),
            content: proposal.content.clone(),
        };
        self.db
            .put(Self::log_key(proposal.txnid), bincode::serialize(&entry)?)?;
        self.set_scalar(CONFIG_LAST_LOGGED_TXID, proposal.txnid.0)?;
        Ok(())
    }

    fn read_entry(&self, txnid: Txnid) -> Result<Option<StoredEntry>> {
        match self.db.get(Self::log_key(txnid))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply a logged proposal to the data keyspace and advance the
    /// committed txnid. Commits are strictly increasing.
    pub fn commit(&self, txnid: Txnid) -> Result<()> {
        let _guard = self.write_lock.lock();

        let last = self.last_committed_txid()?;
        if txnid <= last {
            return Err(CairnError::CommitOutOfOrder { txnid, last });
        }
        let entry = self
            .read_entry(txnid)?
            .ok_or_else(|| CairnError::Storage(format!("commit of unlogged txnid {}", txnid)))?;

        match OpCode::from_u32(entry.opcode)? {
            OpCode::Set => self.db.put(Self::data_key(&entry.key), &entry.content)?,
            OpCode::Delete => self.db.delete(Self::data_key(&entry.key))?,
        }
        self.set_scalar(CONFIG_LAST_COMMITTED_TXID, txnid.0)?;
        debug!(txnid = %txnid, key = %entry.key, "committed");
        Ok(())
    }

    /// The log suffix strictly after the given txnid, in txnid order.
    pub fn log_entries_after(&self, txnid: Txnid) -> Result<Vec<LogEntry>> {
        let start = Self::log_key(Txnid(txnid.0.saturating_add(1)));
        let prefix = PREFIX_COMMIT_LOG.as_bytes();
        let mut entries = Vec::new();

        let iter = self
            .db
            .iterator(rocksdb::IteratorMode::From(&start, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let raw: [u8; 8] = key[prefix.len()..].try_into().map_err(|_| {
                CairnError::CorruptStore("malformed commit log key".to_string())
            })?;
            let entry: StoredEntry = bincode::deserialize(&value)?;
            entries.push(LogEntry {
                version: PROTOCOL_VERSION,
                txnid: Txnid(u64::from_be_bytes(raw)),
                opcode: entry.opcode,
                key: entry.key,
                content: entry.content,
            });
        }
        Ok(entries)
    }

    /// Read an applied value.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(Self::data_key(key))?.map(|v| v.to_vec()))
    }
}

/// Whether `txnid` is the legal successor of `last` in a gap-free log:
/// the next counter within the same epoch, or the first counter of a
/// later epoch.
pub(crate) fn follows(txnid: Txnid, last: Txnid) -> bool {
    if txnid.epoch() == last.epoch() {
        last.counter()
            .checked_add(1)
            .map(|next| txnid.counter() == next)
            .unwrap_or(false)
    } else {
        txnid.epoch() > last.epoch() && txnid.counter() == 1
    }
}

/// [`ActionHandler`] over a shared [`MetaStore`].
pub struct StoreHandler {
    store: Arc<MetaStore>,
    fid: Fid,
    ensemble_size: u64,
    request_mgr: Option<Arc<ClientRequestMgr>>,
}

impl StoreHandler {
    pub fn new(
        store: Arc<MetaStore>,
        fid: Fid,
        ensemble_size: u64,
        request_mgr: Option<Arc<ClientRequestMgr>>,
    ) -> Self {
        Self {
            store,
            fid,
            ensemble_size,
            request_mgr,
        }
    }

    fn notify(&self, fid: &Fid, reqid: ReqId, error: &str) {
        // Only requests this peer originated have a local waiter.
        if *fid != self.fid {
            return;
        }
        if let Some(mgr) = &self.request_mgr {
            mgr.complete(reqid, error);
        }
    }
}

impl ActionHandler for StoreHandler {
    fn last_logged_txid(&self) -> Result<Txnid> {
        self.store.last_logged_txid()
    }

    fn last_committed_txid(&self) -> Result<Txnid> {
        self.store.last_committed_txid()
    }

    fn accepted_epoch(&self) -> Result<Epoch> {
        self.store.accepted_epoch()
    }

    fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        self.store.set_accepted_epoch(epoch)
    }

    fn current_epoch(&self) -> Result<Epoch> {
        self.store.current_epoch()
    }

    fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        self.store.set_current_epoch(epoch)
    }

    fn log_proposal(&self, proposal: &Proposal) -> Result<()> {
        self.store.log_proposal(proposal)
    }

    fn log_entries_after(&self, txnid: Txnid) -> Result<Vec<LogEntry>> {
        self.store.log_entries_after(txnid)
    }

    fn commit(&self, txnid: Txnid) -> Result<()> {
        self.store.commit(txnid)
    }

    fn abort(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()> {
        let error = if error.is_empty() { "aborted" } else { error };
        self.notify(fid, reqid, error);
        Ok(())
    }

    fn respond(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()> {
        self.notify(fid, reqid, error);
        Ok(())
    }

    fn follower_id(&self) -> Fid {
        self.fid.clone()
    }

    fn ensemble_size(&self) -> u64 {
        self.ensemble_size
    }
}
