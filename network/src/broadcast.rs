//! # Broadcast Service
//!
//! Flood dissemination: one message, every connection in the current
//! peer-group snapshot (minus the peer it came from), sent concurrently.
//!
//! Each send is its own I/O pool task under a send timeout that starts
//! when the send is submitted, so a slow or dead peer (or a saturated
//! pool) costs one failure entry and nothing else. The outcome of a
//! broadcast is data, not an error: [`BroadcastResult`] counts successes
//! and failures and lists what went wrong per connection. There is no
//! retry. Epidemic redundancy across the mesh covers lost sends.
//!
//! "Success" means the frame was written and flushed. The protocol has no
//! acknowledgements.
//!
//! Connections whose send failed are dropped from the peer group.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::io_pool::IoPool;
use crate::message::NetworkMessage;
use crate::peer_group::{ConnectionId, PeerGroup};
use crate::transport::Address;

/// One failed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFailure {
    pub connection_id: ConnectionId,
    pub peer_address: Address,
    pub error: String,
}

/// Outcome of one broadcast. `num_success + num_failure` equals the number
/// of connections that were attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    num_success: usize,
    num_failure: usize,
    failures: Vec<BroadcastFailure>,
}

impl BroadcastResult {
    /// Nothing was sent: no peers, or nothing to send.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn num_success(&self) -> usize {
        self.num_success
    }

    pub fn num_failure(&self) -> usize {
        self.num_failure
    }

    pub fn failures(&self) -> &[BroadcastFailure] {
        &self.failures
    }

    pub fn num_attempted(&self) -> usize {
        self.num_success + self.num_failure
    }

    fn record_success(&mut self) {
        self.num_success += 1;
    }

    fn record_failure(&mut self, failure: BroadcastFailure) {
        self.num_failure += 1;
        self.failures.push(failure);
    }
}

pub struct BroadcastService {
    peer_group: Arc<PeerGroup>,
    io_pool: Arc<IoPool>,
    send_timeout: Duration,
}

impl BroadcastService {
    pub fn new(peer_group: Arc<PeerGroup>, io_pool: Arc<IoPool>, send_timeout: Duration) -> Self {
        Self {
            peer_group,
            io_pool,
            send_timeout,
        }
    }

    pub fn peer_group(&self) -> &Arc<PeerGroup> {
        &self.peer_group
    }

    /// Sends `message` to every connection except `exclude`.
    pub async fn broadcast(
        &self,
        message: &NetworkMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastResult {
        let targets: Vec<_> = self
            .peer_group
            .all_connections()
            .into_iter()
            .filter(|c| Some(c.id()) != exclude)
            .collect();

        let mut result = BroadcastResult::empty();
        if targets.is_empty() {
            debug!(kind = message.kind(), "no peers to broadcast to");
            return result;
        }

        let frame = match codec::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                for connection in &targets {
                    result.record_failure(BroadcastFailure {
                        connection_id: connection.id(),
                        peer_address: connection.peer_address().clone(),
                        error: e.to_string(),
                    });
                }
                warn!(kind = message.kind(), error = %e, "broadcast message could not be encoded");
                return result;
            }
        };

        let timeout = self.send_timeout;
        let sends = targets.into_iter().map(|connection| {
            let frame = frame.clone();
            let task = self.io_pool.spawn({
                let connection = Arc::clone(&connection);
                async move { connection.send_frame(&frame).await }
            });
            async move {
                // The deadline covers the wait for a pool permit as well.
                let outcome = match task {
                    Ok(task) => {
                        let abort = task.abort_handle();
                        match tokio::time::timeout(timeout, task).await {
                            Ok(Ok(Ok(()))) => Ok(()),
                            Ok(Ok(Err(e))) => Err(e.to_string()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => {
                                abort.abort();
                                Err(format!("send timed out after {}ms", timeout.as_millis()))
                            }
                        }
                    }
                    Err(e) => Err(e.to_string()),
                };
                (connection, outcome)
            }
        });

        for (connection, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => result.record_success(),
                Err(error) => {
                    warn!(
                        connection = %connection.id(),
                        peer = %connection.peer_address(),
                        %error,
                        "broadcast send failed"
                    );
                    if self.peer_group.remove_connection(&connection.id()).is_some() {
                        connection.close().await;
                    }
                    result.record_failure(BroadcastFailure {
                        connection_id: connection.id(),
                        peer_address: connection.peer_address().clone(),
                        error,
                    });
                }
            }
        }

        debug!(
            kind = message.kind(),
            success = result.num_success(),
            failure = result.num_failure(),
            "broadcast complete"
        );
        result
    }
}
