//! Ingress queue (M8): the single entry point for everything that wants
//! to mutate the dispatch tree from outside the tick loop -- graph
//! submissions, worker status reports, heartbeats, and admin edits.
//!
//! Grounded on the teacher's `mpsc`-channel-plus-`tokio::select!` pattern
//! in `orchestrator/mod.rs` (there: lifecycle completions fed back to the
//! loop over a bounded channel). Here the channel is the *input* side
//! instead, and a small deadline wheel stands in for the deferred-
//! autoretry timer described by spec §5 -- generalized from nothing in
//! the teacher (it never needed deferred re-scheduling), sized for the
//! tens of in-flight retries a render farm actually carries rather than
//! pulling in a dedicated timer-wheel crate for it.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::model::{CommandId, CommandStatus, Node, NodeId, NodeStatus, PoolShare, PoolShareId, RenderNodeId};
use crate::tree::GraphSubmission;

/// Default bounded capacity for the ingress channel (spec §5).
pub const DEFAULT_INGRESS_CAPACITY: usize = 10_000;

/// An admin-initiated edit (spec §6 admin endpoints).
#[derive(Debug, Clone)]
pub enum AdminEdit {
    SetStatus { node: NodeId, status: NodeStatus },
    SetPaused { node: NodeId, paused: bool },
    SetDispatchKey { node: NodeId, dispatch_key: i64 },
    SetMaxRn { pool_share: crate::model::PoolShareId, max_rn: i64 },
    ClearQuarantine { render_node: RenderNodeId },
    CancelNode { node: NodeId },
}

/// Everything that can arrive between ticks. A submission carries a
/// reply channel so the submitting HTTP handler can report the assigned
/// node ids back to the caller; everything else is fire-and-forget from
/// the ingress side (the tick loop logs failures).
pub enum IngressEvent {
    SubmitGraph {
        submission: GraphSubmission,
        reply: oneshot::Sender<anyhow::Result<Vec<NodeId>>>,
    },
    /// Worker status update addressed by render-node *name* (spec §6's
    /// `PUT /rendernodes/<name>/commands/<id>/`) rather than id, since that
    /// is what the wire contract gives the HTTP handler.
    CommandStatusUpdate {
        render_node: String,
        command: CommandId,
        status: CommandStatus,
        completion: f64,
        message: String,
        stats: Option<Value>,
        /// Lets the HTTP handler turn an invariant violation (unknown
        /// render node, command not assigned to it) into the 404-class
        /// response spec'd for worker-initiated updates, instead of
        /// silently dropping it.
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Heartbeat {
        render_node: String,
        at: DateTime<Utc>,
    },
    /// An administrative mutation with a reply channel so the HTTP handler
    /// that issued it can report success/failure back to the caller.
    AdminEdit {
        edit: AdminEdit,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    /// A read-only snapshot of every node, for `GET /query` and friends.
    /// Filtering/projection happens in the HTTP layer, not here.
    Query {
        reply: oneshot::Sender<Vec<Node>>,
    },
    ListPoolShares {
        reply: oneshot::Sender<Vec<PoolShare>>,
    },
    CreatePoolShare {
        pool: String,
        node: NodeId,
        max_rn: i64,
        reply: oneshot::Sender<anyhow::Result<PoolShareId>>,
    },
    /// A command whose deferred autoretry delay has elapsed.
    AutoretryFire(CommandId),
}

/// The producer half, cloned into every HTTP handler and admin path.
#[derive(Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<IngressEvent>,
}

impl IngressSender {
    /// Enqueues an event, waiting if the channel is at capacity
    /// (spec §5's backpressure-on-full policy).
    pub async fn send(&self, event: IngressEvent) -> Result<(), mpsc::error::SendError<IngressEvent>> {
        self.tx.send(event).await
    }

    pub fn try_send(&self, event: IngressEvent) -> Result<(), mpsc::error::TrySendError<IngressEvent>> {
        self.tx.try_send(event)
    }
}

/// The consumer half, owned by the tick loop.
pub struct IngressReceiver {
    rx: mpsc::Receiver<IngressEvent>,
}

impl IngressReceiver {
    /// Drains every event currently queued without blocking, so a tick
    /// sees exactly the events that landed before it started (spec §5's
    /// per-tick ordering guarantee).
    pub fn drain(&mut self) -> Vec<IngressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for at least one event, for the idle-tick case where the
    /// loop has nothing else to do until ingress or the timer fires.
    pub async fn recv(&mut self) -> Option<IngressEvent> {
        self.rx.recv().await
    }
}

pub fn channel(capacity: usize) -> (IngressSender, IngressReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IngressSender { tx }, IngressReceiver { rx })
}

/// Deferred-autoretry timer: schedules a command for an
/// [`IngressEvent::AutoretryFire`] some delay after it is timed out or
/// errored, instead of the tick loop spinning on a raw sleeping thread
/// per command. Entries are kept deadline-sorted so polling for expired
/// ones is a prefix scan, not a full pass.
pub struct RetryTimer {
    deadlines: Vec<(Instant, CommandId)>,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self {
            deadlines: Vec::new(),
        }
    }

    pub fn schedule(&mut self, command: CommandId, delay: std::time::Duration) {
        let deadline = Instant::now() + delay;
        let pos = self.deadlines.partition_point(|(d, _)| *d <= deadline);
        self.deadlines.insert(pos, (deadline, command));
    }

    /// Returns every entry whose delay has elapsed, removing them.
    pub fn poll_expired(&mut self) -> Vec<CommandId> {
        let now = Instant::now();
        let split = self.deadlines.partition_point(|(d, _)| *d <= now);
        self.deadlines.drain(..split).map(|(_, cmd)| cmd).collect()
    }
}

impl Default for RetryTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_collects_everything_queued_without_blocking() {
        let (tx, mut rx) = channel(4);
        tx.send(IngressEvent::Heartbeat {
            render_node: "rn01:3000".into(),
            at: Utc::now(),
        })
        .await
        .unwrap();
        tx.send(IngressEvent::Heartbeat {
            render_node: "rn02:3000".into(),
            at: Utc::now(),
        })
        .await
        .unwrap();

        let drained = rx.drain();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn retry_timer_does_not_fire_before_delay_elapses() {
        let mut timer = RetryTimer::new();
        timer.schedule(CommandId(1), std::time::Duration::from_secs(60));
        assert!(timer.poll_expired().is_empty());
    }
}
