//! Per-pump fan-out primitive: forward to children, mark source offsets,
//! trigger commits.
//!
//! A pipe is created for each pump and handed to its processor via
//! [`Processor::with_pipe`](crate::processor::Processor::with_pipe). It also
//! carries the pump's duration clock: [`forward`](Pipe::forward) pauses the
//! clock for the span of child accepts, so [`duration`](Pipe::duration)
//! reflects only time spent inside the owning processor.
//!
//! Separating [`mark`](Pipe::mark) (cheap, per-message) from
//! [`commit`](Pipe::commit) (coordinated, periodic) lets processors
//! acknowledge progress on every message while deferring offset-commit work
//! to the supervisor's cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::metastore::Metastore;
use crate::pump::Pump;
use crate::supervisor::Supervisor;
use crate::topology::NodeId;

/// Own-processor time accumulator.
struct Clock {
    acc: Duration,
    mark: Instant,
}

/// Shared state behind a cloneable pipe handle.
struct PipeInner {
    store: Arc<dyn Metastore>,
    supervisor: Arc<dyn Supervisor>,
    owner: NodeId,
    children: Vec<Arc<dyn Pump>>,
    clock: Mutex<Clock>,
}

/// Forwarding, marking, and commit handle bound to one processor node.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// Creates a pipe bound to (`store`, `supervisor`, `owner`, `children`).
    #[must_use]
    pub fn new(
        store: Arc<dyn Metastore>,
        supervisor: Arc<dyn Supervisor>,
        owner: NodeId,
        children: Vec<Arc<dyn Pump>>,
    ) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                store,
                supervisor,
                owner,
                children,
                clock: Mutex::new(Clock {
                    acc: Duration::ZERO,
                    mark: Instant::now(),
                }),
            }),
        }
    }

    /// Delivers `msg` to every child in order, short-circuiting on the
    /// first error. Fan-out clones are logical: all children but the last
    /// receive a clone, the last receives the original.
    ///
    /// # Errors
    ///
    /// Returns the first child's accept error unchanged.
    pub fn forward(&self, msg: Message) -> Result<()> {
        self.clock_stop();
        let result = self.forward_children(msg);
        self.clock_start();
        result
    }

    /// Delivers `msg` to `children[index]` only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is out of bounds, or
    /// the child's accept error unchanged.
    pub fn forward_to_child(&self, msg: Message, index: usize) -> Result<()> {
        self.clock_stop();
        let result = self.forward_one(msg, index);
        self.clock_start();
        result
    }

    /// Records the message's source-metadata token against the owning
    /// processor. No-op if the message carries no provenance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mark`] if the metastore rejects the token.
    pub fn mark(&self, msg: &Message) -> Result<()> {
        let (Some(source), Some(token)) = msg.metadata() else {
            return Ok(());
        };
        self.inner
            .store
            .mark(self.inner.owner, source, Arc::clone(token))
            .map_err(Error::Mark)
    }

    /// Marks the message, then asks the supervisor to commit on behalf of
    /// the owning processor. Either error aborts and surfaces.
    ///
    /// # Errors
    ///
    /// Returns the mark error or the supervisor's commit error.
    pub fn commit(&self, msg: &Message) -> Result<()> {
        self.mark(msg)?;
        self.inner.supervisor.commit(self.inner.owner)
    }

    /// Returns the accumulated own-processor time since the last reset.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.inner.clock.lock().acc
    }

    /// Zeros the duration counter.
    pub fn reset(&self) {
        let mut clock = self.inner.clock.lock();
        clock.acc = Duration::ZERO;
        clock.mark = Instant::now();
    }

    /// True if this pipe has no children (terminal node).
    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.children.is_empty()
    }

    /// Resumes the owner's duration clock. Called by pumps just before
    /// invoking the processor.
    pub(crate) fn clock_start(&self) {
        self.inner.clock.lock().mark = Instant::now();
    }

    /// Pauses the owner's duration clock, accumulating the elapsed span.
    pub(crate) fn clock_stop(&self) {
        let mut clock = self.inner.clock.lock();
        let elapsed = clock.mark.elapsed();
        clock.acc += elapsed;
    }

    fn forward_children(&self, msg: Message) -> Result<()> {
        let children = &self.inner.children;
        match children.len() {
            0 => Ok(()),
            1 => children[0].accept(msg),
            n => {
                if let Some(source) = msg.metadata().0 {
                    self.inner.supervisor.message_forked(source, n - 1);
                }
                for child in &children[..n - 1] {
                    child.accept(msg.clone())?;
                }
                children[n - 1].accept(msg)
            }
        }
    }

    fn forward_one(&self, msg: Message, index: usize) -> Result<()> {
        let children = &self.inner.children;
        if index >= children.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: children.len(),
            });
        }
        children[index].accept(msg)
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("owner", &self.inner.owner)
            .field("children", &self.inner.children.len())
            .finish_non_exhaustive()
    }
}
