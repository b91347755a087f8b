//! Shared fixtures for Cairn integration tests.

use cairn::config::PeerEndpoint;
use cairn::error::{CairnError, Result};
use cairn::message::{LogEntry, Proposal, PROTOCOL_VERSION};
use cairn::protocol::{ActionHandler, ClientRequestMgr};
use cairn::types::{Epoch, Fid, OpCode, ReqId, Txnid};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// In-memory [`ActionHandler`] with the same log and commit semantics as
/// the persistent store, plus call recording for assertions.
pub struct MemHandler {
    fid: Fid,
    ensemble: u64,
    request_mgr: Option<Arc<ClientRequestMgr>>,
    state: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    log: BTreeMap<Txnid, (u32, String, Vec<u8>)>,
    applied: BTreeMap<String, Vec<u8>>,
    accepted_epoch: Epoch,
    current_epoch: Epoch,
    last_committed: Txnid,
    responses: Vec<(Fid, ReqId, String)>,
    aborts: Vec<(Fid, ReqId, String)>,
}

impl MemHandler {
    pub fn new(fid: &str, ensemble: u64) -> Self {
        Self {
            fid: fid.to_string(),
            ensemble,
            request_mgr: None,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Wire a request manager in so responses and aborts complete local
    /// submissions, the way the store-backed handler does.
    pub fn with_request_mgr(mut self, mgr: Arc<ClientRequestMgr>) -> Self {
        self.request_mgr = Some(mgr);
        self
    }

    /// Seed the log (and optionally the committed prefix) before a test.
    pub fn seed_log(&self, entries: &[(Txnid, &str, &[u8])], committed_through: Txnid) {
        let mut state = self.state.lock();
        for (txnid, key, content) in entries {
            state
                .log
                .insert(*txnid, (OpCode::Set.as_u32(), key.to_string(), content.to_vec()));
            if *txnid <= committed_through {
                let value = content.to_vec();
                state.applied.insert(key.to_string(), value);
            }
        }
        state.last_committed = committed_through;
    }

    pub fn set_epochs(&self, accepted: Epoch, current: Epoch) {
        let mut state = self.state.lock();
        state.accepted_epoch = accepted;
        state.current_epoch = current;
    }

    pub fn log_txnids(&self) -> Vec<Txnid> {
        self.state.lock().log.keys().copied().collect()
    }

    pub fn committed(&self) -> Txnid {
        self.state.lock().last_committed
    }

    pub fn applied(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().applied.get(key).cloned()
    }

    pub fn epochs(&self) -> (Epoch, Epoch) {
        let state = self.state.lock();
        (state.accepted_epoch, state.current_epoch)
    }

    pub fn responses(&self) -> Vec<(Fid, ReqId, String)> {
        self.state.lock().responses.clone()
    }

    pub fn aborts(&self) -> Vec<(Fid, ReqId, String)> {
        self.state.lock().aborts.clone()
    }
}

impl ActionHandler for MemHandler {
    fn last_logged_txid(&self) -> Result<Txnid> {
        Ok(self
            .state
            .lock()
            .log
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Txnid::ZERO))
    }

    fn last_committed_txid(&self) -> Result<Txnid> {
        Ok(self.state.lock().last_committed)
    }

    fn accepted_epoch(&self) -> Result<Epoch> {
        Ok(self.state.lock().accepted_epoch)
    }

    fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        self.state.lock().accepted_epoch = epoch;
        Ok(())
    }

    fn current_epoch(&self) -> Result<Epoch> {
        Ok(self.state.lock().current_epoch)
    }

    fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        self.state.lock().current_epoch = epoch;
        Ok(())
    }

    fn log_proposal(&self, proposal: &Proposal) -> Result<()> {
        let mut state = self.state.lock();
        let last = state.log.keys().next_back().copied().unwrap_or(Txnid::ZERO);
        if proposal.txnid <= last {
            return match state.log.get(&proposal.txnid) {
                Some((op, key, content))
                    if *op == proposal.opcode
                        && *key == proposal.key
                        && *content == proposal.content =>
                {
                    Ok(())
                }
                _ => Err(CairnError::LogConflict {
                    txnid: proposal.txnid,
                }),
            };
        }
        let contiguous = if proposal.txnid.epoch() == last.epoch() {
            last.counter()
                .checked_add(1)
                .map(|next| proposal.txnid.counter() == next)
                .unwrap_or(false)
        } else {
            proposal.txnid.epoch() > last.epoch() && proposal.txnid.counter() == 1
        };
        if !contiguous {
            return Err(CairnError::LogGap {
                txnid: proposal.txnid,
                last,
            });
        }
        state.log.insert(
            proposal.txnid,
            (proposal.opcode, proposal.key.clone(), proposal.content.clone()),
        );
        Ok(())
    }

    fn log_entries_after(&self, txnid: Txnid) -> Result<Vec<LogEntry>> {
        Ok(self
            .state
            .lock()
            .log
            .range(Txnid(txnid.0.saturating_add(1))..)
            .map(|(t, (op, key, content))| LogEntry {
                version: PROTOCOL_VERSION,
                txnid: *t,
                opcode: *op,
                key: key.clone(),
                content: content.clone(),
            })
            .collect())
    }

    fn commit(&self, txnid: Txnid) -> Result<()> {
        let mut state = self.state.lock();
        if txnid <= state.last_committed {
            return Err(CairnError::CommitOutOfOrder {
                txnid,
                last: state.last_committed,
            });
        }
        let (op, key, content) = state
            .log
            .get(&txnid)
            .cloned()
            .ok_or_else(|| CairnError::Storage(format!("commit of unlogged txnid {}", txnid)))?;
        match OpCode::from_u32(op)? {
            OpCode::Set => {
                state.applied.insert(key, content);
            }
            OpCode::Delete => {
                state.applied.remove(&key);
            }
        }
        state.last_committed = txnid;
        Ok(())
    }

    fn abort(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()> {
        self.state
            .lock()
            .aborts
            .push((fid.clone(), reqid, error.to_string()));
        if *fid == self.fid {
            if let Some(mgr) = &self.request_mgr {
                mgr.complete(reqid, if error.is_empty() { "aborted" } else { error });
            }
        }
        Ok(())
    }

    fn respond(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()> {
        self.state
            .lock()
            .responses
            .push((fid.clone(), reqid, error.to_string()));
        if *fid == self.fid {
            if let Some(mgr) = &self.request_mgr {
                mgr.complete(reqid, error);
            }
        }
        Ok(())
    }

    fn follower_id(&self) -> Fid {
        self.fid.clone()
    }

    fn ensemble_size(&self) -> u64 {
        self.ensemble
    }
}

/// Reserve a free localhost UDP address.
pub fn free_udp_addr() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    let addr = socket.local_addr().expect("local addr");
    drop(socket);
    addr.to_string()
}

/// Reserve a free localhost TCP address.
pub fn free_tcp_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

/// Build endpoint records for the given fids, reserving fresh localhost
/// ports for each.
pub fn make_endpoints(fids: &[(&str, bool)]) -> Vec<PeerEndpoint> {
    fids.iter()
        .map(|(fid, voting)| PeerEndpoint {
            fid: fid.to_string(),
            election_addr: free_udp_addr(),
            message_addr: free_tcp_addr(),
            voting: *voting,
        })
        .collect()
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
