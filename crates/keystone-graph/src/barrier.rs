//! Readiness barriers
//!
//! A barrier separates "created" from "usable". After a node's creation
//! operation succeeds, its barrier is awaited asynchronously; consumers with a
//! readiness edge stay Pending until it is satisfied. Waiting never blocks the
//! executor: other branches keep progressing while a barrier polls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::error::NodeError;
use crate::node::NodeView;

/// Default interval between readiness probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on how long a barrier is awaited
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);

/// Timing for a readiness barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPolicy {
    /// Interval between probes
    pub poll_interval: Duration,
    /// Give up and fail the node after this long
    pub max_wait: Duration,
}

impl Default for BarrierPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// A single readiness observation against a created resource.
///
/// `Ok(false)` means "not yet"; the probe is asked again after the poll
/// interval. `Err` means the resource can never become ready and fails the
/// node immediately. Transient observation errors should be reported as
/// `Ok(false)`.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Short human-readable description for logs
    fn describe(&self) -> String;

    /// Observe the resource once
    async fn probe(&self, node: &NodeView) -> Result<bool, NodeError>;
}

/// Resolves once a created node is usable.
#[async_trait]
pub trait ReadinessPredicate: Send + Sync {
    /// Short human-readable description for logs
    fn describe(&self) -> String;

    /// Wait until ready. Cancellation on timeout is handled by the barrier.
    async fn await_ready(&self, node: &NodeView, poll_interval: Duration)
        -> Result<(), NodeError>;
}

/// Adapts a [`ReadinessProbe`] into a predicate by polling it
pub struct Polled<P>(pub P);

#[async_trait]
impl<P> ReadinessPredicate for Polled<P>
where
    P: ReadinessProbe + 'static,
{
    fn describe(&self) -> String {
        self.0.describe()
    }

    async fn await_ready(
        &self,
        node: &NodeView,
        poll_interval: Duration,
    ) -> Result<(), NodeError> {
        loop {
            if self.0.probe(node).await? {
                return Ok(());
            }
            trace!(node = %node.id, probe = %self.0.describe(), "not ready yet");
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Becomes true a fixed time after the node was created.
///
/// Used as a settle delay where the resource offers nothing to observe.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

#[async_trait]
impl ReadinessPredicate for FixedDelay {
    fn describe(&self) -> String {
        format!("fixed delay of {}s", self.0.as_secs())
    }

    async fn await_ready(&self, _node: &NodeView, _poll_interval: Duration) -> Result<(), NodeError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// A readiness predicate together with its timing policy
#[derive(Clone)]
pub struct ReadinessBarrier {
    predicate: Arc<dyn ReadinessPredicate>,
    policy: BarrierPolicy,
}

impl fmt::Debug for ReadinessBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessBarrier")
            .field("predicate", &self.predicate.describe())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ReadinessBarrier {
    /// Barrier over an arbitrary predicate
    pub fn new(predicate: Arc<dyn ReadinessPredicate>, policy: BarrierPolicy) -> Self {
        Self { predicate, policy }
    }

    /// Barrier that polls `probe` at the policy's interval
    pub fn polling<P>(probe: P, policy: BarrierPolicy) -> Self
    where
        P: ReadinessProbe + 'static,
    {
        Self::new(Arc::new(Polled(probe)), policy)
    }

    /// Barrier satisfied `delay` after creation.
    ///
    /// The maximum wait is set to twice `delay`, or [`DEFAULT_MAX_WAIT`] if
    /// that is longer, so the timer always fires first. Use
    /// [`with_max_wait`](Self::with_max_wait) to impose a tighter bound.
    pub fn fixed_delay(delay: Duration) -> Self {
        let policy = BarrierPolicy {
            max_wait: DEFAULT_MAX_WAIT.max(delay * 2),
            ..BarrierPolicy::default()
        };
        Self::new(Arc::new(FixedDelay(delay)), policy)
    }

    /// Override the maximum wait
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.policy.max_wait = max_wait;
        self
    }

    /// Timing policy
    pub fn policy(&self) -> BarrierPolicy {
        self.policy
    }

    /// Description of the underlying predicate
    pub fn describe(&self) -> String {
        self.predicate.describe()
    }

    /// Await readiness, failing with `BarrierTimeout` after `max_wait`
    pub async fn wait(&self, node: &NodeView) -> Result<(), NodeError> {
        let waiting = self.predicate.await_ready(node, self.policy.poll_interval);
        match tokio::time::timeout(self.policy.max_wait, waiting).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::BarrierTimeout {
                waited: self.policy.max_wait,
            }),
        }
    }
}
