//! In-process client request manager.
//!
//! [`ClientRequestMgr`] is the bridge between embedding code and the
//! protocol: `submit` turns a mutation into a [`RequestHandle`] on the
//! request channel, the serving actor forwards it to the leader, and the
//! eventual response or abort completes the caller's oneshot.

use super::{RequestHandle, RequestMgr, MAX_PROPOSALS};
use crate::error::{CairnError, Result};
use crate::message::{Request, PROTOCOL_VERSION};
use crate::types::{Fid, OpCode, ReqId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Outcome delivered to a submitter: `Ok(())` on commit, `Err(msg)` on
/// abort or peer loss.
pub type RequestOutcome = std::result::Result<(), String>;

pub struct ClientRequestMgr {
    fid: Fid,
    next_reqid: AtomicU64,
    incoming_tx: mpsc::Sender<RequestHandle>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<RequestHandle>>,
    pending: Mutex<HashMap<ReqId, RequestHandle>>,
}

impl ClientRequestMgr {
    pub fn new(fid: Fid) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(MAX_PROPOSALS);
        Self {
            fid,
            next_reqid: AtomicU64::new(0),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a mutation. The returned channel resolves once the request
    /// commits or aborts; it closes without a value if the serving peer
    /// dies before parking the request.
    pub async fn submit(
        &self,
        opcode: OpCode,
        key: &str,
        content: Vec<u8>,
    ) -> Result<oneshot::Receiver<RequestOutcome>> {
        let reqid = self.next_reqid.fetch_add(1, Ordering::SeqCst) + 1;
        let (done_tx, done_rx) = oneshot::channel();

        let request = Request {
            version: PROTOCOL_VERSION,
            reqid,
            opcode: opcode.as_u32(),
            key: key.to_string(),
            content,
        };
        let handle = RequestHandle {
            request,
            completion: Some(done_tx),
        };

        self.incoming_tx
            .send(handle)
            .await
            .map_err(|_| CairnError::Internal("request channel closed".to_string()))?;
        Ok(done_rx)
    }

    /// Complete a parked request. Called when its response or abort comes
    /// back from the protocol; an empty error means success.
    pub fn complete(&self, reqid: ReqId, error: &str) {
        let handle = self.pending.lock().remove(&reqid);
        match handle {
            Some(handle) => {
                debug!(fid = %self.fid, reqid, error = %error, "request completed");
                if let Some(tx) = handle.completion {
                    let outcome = if error.is_empty() {
                        Ok(())
                    } else {
                        Err(error.to_string())
                    };
                    let _ = tx.send(outcome);
                }
            }
            None => debug!(fid = %self.fid, reqid, "completion for unknown request"),
        }
    }

    /// Number of parked requests.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl RequestMgr for ClientRequestMgr {
    async fn next_request(&self) -> Option<RequestHandle> {
        self.incoming_rx.lock().await.recv().await
    }

    fn add_pending_request(&self, handle: RequestHandle) {
        self.pending.lock().insert(handle.request.reqid, handle);
    }

    fn cleanup_on_error(&self) {
        let drained: Vec<RequestHandle> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, h)| h).collect()
        };
        if !drained.is_empty() {
            warn!(fid = %self.fid, count = drained.len(), "failing pending requests");
        }
        for handle in drained {
            if let Some(tx) = handle.completion {
                let _ = tx.send(Err("peer lost".to_string()));
            }
        }
    }
}
