// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::ReplicationConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Durability directive carried by every replicated mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Enqueue to all replicas, do not wait for acknowledgements.
    Async,
    /// Wait until at least `replication_factor` replicas acknowledged.
    Sync,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("replication broadcast failed: {acknowledged} of {required} replicas acknowledged")]
pub struct BroadcastError {
    pub acknowledged: usize,
    pub required: usize,
}

/// A peer holding a copy of a replicated structure. Implementations apply
/// operations strictly in the order they are received.
#[async_trait]
pub trait Replica<Op: Send + 'static>: Send + Sync {
    async fn apply(&self, op: Op) -> Result<(), String>;
}

struct ReplicaChannel<Op> {
    sender: mpsc::UnboundedSender<(Op, Option<oneshot::Sender<bool>>)>,
    alive: Arc<AtomicBool>,
}

/// Fans mutations out to a set of replicas. Each replica is fed through its
/// own FIFO queue by a dedicated forwarder task, so operations submitted by
/// one owner apply in submission order on every replica, for both
/// replication modes. A replica that fails to apply an operation is dropped
/// from the set; once more than `failover_factor` replicas are lost the
/// replicated structure is considered corrupt and every further broadcast
/// fails.
pub struct Replicator<Op> {
    channels: Vec<ReplicaChannel<Op>>,
    replication_factor: usize,
    failover_factor: usize,
    broadcast_timeout: Duration,
    lost: Arc<AtomicUsize>,
}

impl<Op: Clone + Send + 'static> Replicator<Op> {
    pub fn new(replicas: Vec<Arc<dyn Replica<Op>>>, config: &ReplicationConfig) -> Replicator<Op> {
        let lost = Arc::new(AtomicUsize::new(0));
        let channels = replicas
            .into_iter()
            .map(|replica| Self::spawn_forwarder(replica, lost.clone()))
            .collect();
        Replicator {
            channels,
            replication_factor: config.replication_factor,
            failover_factor: config.failover_factor,
            broadcast_timeout: config.broadcast_timeout,
            lost,
        }
    }

    fn spawn_forwarder(
        replica: Arc<dyn Replica<Op>>,
        lost: Arc<AtomicUsize>,
    ) -> ReplicaChannel<Op> {
        let (sender, mut receiver) =
            mpsc::unbounded_channel::<(Op, Option<oneshot::Sender<bool>>)>();
        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();

        tokio::spawn(async move {
            while let Some((op, ack)) = receiver.recv().await {
                match replica.apply(op).await {
                    Ok(()) => {
                        if let Some(ack) = ack {
                            let _ = ack.send(true);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "replica failed to apply operation, dropping it from the replica set");
                        alive_flag.store(false, Ordering::SeqCst);
                        lost.fetch_add(1, Ordering::SeqCst);
                        if let Some(ack) = ack {
                            let _ = ack.send(false);
                        }
                        // queued acknowledgements resolve as failed when the
                        // channel is dropped
                        break;
                    }
                }
            }
        });

        ReplicaChannel { sender, alive }
    }

    pub fn replica_count(&self) -> usize {
        self.channels.len()
    }

    pub fn lost_count(&self) -> usize {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.lost_count() > self.failover_factor
    }

    pub async fn broadcast(&self, op: Op, mode: ReplicationMode) -> Result<(), BroadcastError> {
        if self.is_degraded() {
            return Err(BroadcastError {
                acknowledged: 0,
                required: self.replication_factor,
            });
        }

        match mode {
            ReplicationMode::Async => {
                for channel in &self.channels {
                    if channel.alive.load(Ordering::SeqCst) {
                        let _ = channel.sender.send((op.clone(), None));
                    }
                }
                Ok(())
            }
            ReplicationMode::Sync => {
                let mut acks = Vec::with_capacity(self.channels.len());
                for channel in &self.channels {
                    if !channel.alive.load(Ordering::SeqCst) {
                        continue;
                    }
                    let (ack_sender, ack_receiver) = oneshot::channel();
                    if channel
                        .sender
                        .send((op.clone(), Some(ack_sender)))
                        .is_ok()
                    {
                        acks.push(ack_receiver);
                    }
                }

                let acknowledged =
                    match tokio::time::timeout(self.broadcast_timeout, futures::future::join_all(acks))
                        .await
                    {
                        Ok(results) => results
                            .into_iter()
                            .filter(|result| matches!(result, Ok(true)))
                            .count(),
                        Err(_) => 0,
                    };

                if acknowledged >= self.replication_factor {
                    Ok(())
                } else {
                    Err(BroadcastError {
                        acknowledged,
                        required: self.replication_factor,
                    })
                }
            }
        }
    }
}
