//! Commit coordination and error arbitration.
//!
//! [`CommitSupervisor`] owns the commit cadence: a scheduler thread runs a
//! pass every `commit_interval`, and any processor can request an eager
//! pass through [`Pipe::commit`](crate::pipe::Pipe::commit).
//!
//! ## Safe-commit protocol
//!
//! A pass quiesces the graph by acquiring every pump's processor (or
//! source) cell in topological order, waiting for each async pump's inbound
//! buffer to drain before taking its cell. Pumps take batches under the
//! cell lock, so a held cell plus an empty buffer means the pump holds no
//! in-flight work; because upstream cells are acquired first, drained
//! buffers stay drained. Once the whole graph is quiesced, every message
//! that entered it has been fully processed by all descendants, committer
//! hooks run, and each source's offset advances to the greatest marked
//! token. Any message still unconsumed at a crashed edge was never marked,
//! so its offset was never committed: at-least-once delivery.
//!
//! The first fatal error from any pump wins: it is reported once through
//! the error callback; later errors are retained and surface from
//! `Task::close`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{backoff, MessageBuffer};
use crate::error::{Error, Result};
use crate::metastore::Metastore;
use crate::processor::{Processor, Source};
use crate::topology::NodeId;

/// Commit seam between pipes and the coordinator. The in-flight hooks have
/// no-op defaults so test doubles only implement what they observe.
pub trait Supervisor: Send + Sync {
    /// Requests a commit pass on behalf of `origin`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; surfaced through `Pipe::commit`.
    fn commit(&self, origin: NodeId) -> Result<()>;

    /// A source emitted a provenance-carrying message.
    fn message_emitted(&self, _source: NodeId) {}

    /// A fan-out created `copies` additional in-flight paths for a message
    /// originating at `source`.
    fn message_forked(&self, _source: NodeId, _copies: usize) {}

    /// A provenance-carrying message finished at a terminal pump.
    fn message_done(&self, _source: NodeId) {}
}

/// One quiesce unit of the graph, registered in topological order.
#[derive(Clone)]
pub(crate) enum CommitUnit {
    /// A source node: quiesced by holding its cell.
    Source {
        node: NodeId,
        name: String,
        cell: Arc<Mutex<Box<dyn Source>>>,
    },
    /// A processor node: drained (async only), then quiesced by holding
    /// its cell.
    Processor {
        cell: Arc<Mutex<Box<dyn Processor>>>,
        buffer: Option<Arc<MessageBuffer>>,
    },
}

type ErrorCallback = Box<dyn FnMut(&Error) + Send>;

/// The commit coordinator and error arbiter for one task.
pub struct CommitSupervisor {
    store: Arc<dyn Metastore>,
    interval: Duration,

    /// Quiesce units in topological order.
    units: Mutex<Vec<CommitUnit>>,

    /// Per-source count of provenance-carrying messages still live in the
    /// graph. Reporting only; correctness rests on the quiesce protocol.
    inflight: RwLock<FxHashMap<NodeId, Arc<AtomicI64>>>,

    trigger_tx: Mutex<Option<Sender<()>>>,
    trigger_rx: Mutex<Option<Receiver<()>>>,
    errors_tx: Mutex<Option<Sender<Error>>>,
    errors_rx: Mutex<Option<Receiver<Error>>>,

    callback: Arc<Mutex<Option<ErrorCallback>>>,
    collected: Arc<Mutex<Vec<Error>>>,
    failed: Arc<AtomicBool>,

    scheduler: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CommitSupervisor {
    /// Creates a supervisor over `store` with the given commit interval.
    #[must_use]
    pub fn new(store: Arc<dyn Metastore>, interval: Duration) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel();
        let (errors_tx, errors_rx) = mpsc::channel();

        Self {
            store,
            interval,
            units: Mutex::new(Vec::new()),
            inflight: RwLock::new(FxHashMap::default()),
            trigger_tx: Mutex::new(Some(trigger_tx)),
            trigger_rx: Mutex::new(Some(trigger_rx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            callback: Arc::new(Mutex::new(None)),
            collected: Arc::new(Mutex::new(Vec::new())),
            failed: Arc::new(AtomicBool::new(false)),
            scheduler: Mutex::new(None),
            forwarder: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Installs the error callback, invoked once for the first fatal error.
    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(&Error) + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Returns the number of provenance-carrying messages from `source`
    /// still live in the graph.
    #[must_use]
    pub fn inflight(&self, source: NodeId) -> i64 {
        self.inflight
            .read()
            .get(&source)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Registers a quiesce unit. Must be called in topological order.
    pub(crate) fn register(&self, unit: CommitUnit) {
        if let CommitUnit::Source { node, .. } = &unit {
            self.inflight
                .write()
                .insert(*node, Arc::new(AtomicI64::new(0)));
        }
        self.units.lock().push(unit);
    }

    /// Returns a sender pumps use to report fatal errors.
    ///
    /// # Panics
    ///
    /// Panics if the supervisor has been closed.
    pub(crate) fn error_sender(&self) -> Sender<Error> {
        self.errors_tx
            .lock()
            .as_ref()
            .expect("supervisor closed")
            .clone()
    }

    /// Launches the error forwarder and the commit scheduler.
    pub(crate) fn start(this: &Arc<Self>) {
        if let Some(rx) = this.errors_rx.lock().take() {
            let callback = Arc::clone(&this.callback);
            let collected = Arc::clone(&this.collected);
            let failed = Arc::clone(&this.failed);
            *this.forwarder.lock() = Some(thread::spawn(move || {
                let mut reported = false;
                while let Ok(err) = rx.recv() {
                    failed.store(true, Ordering::Release);
                    if !reported {
                        reported = true;
                        if let Some(cb) = callback.lock().as_mut() {
                            cb(&err);
                        }
                    }
                    collected.lock().push(err);
                }
            }));
        }

        if let Some(rx) = this.trigger_rx.lock().take() {
            let supervisor = Arc::clone(this);
            let errors = this.error_sender();
            *this.scheduler.lock() = Some(thread::spawn(move || {
                supervisor.run_scheduler(&rx, &errors);
            }));
        }
    }

    /// Stops the scheduler, attempts a final commit pass on clean shutdown,
    /// stops the error forwarder, and returns the collected errors.
    ///
    /// Idempotent: a second call returns `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] wrapping every error seen during the run.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.trigger_tx.lock().take();
        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            let _ = handle.join();
        }

        if !self.failed.load(Ordering::Acquire) {
            if let Err(e) = self.commit_pass() {
                self.failed.store(true, Ordering::Release);
                self.collected.lock().push(e);
            }
        }

        self.errors_tx.lock().take();
        let forwarder = self.forwarder.lock().take();
        if let Some(handle) = forwarder {
            let _ = handle.join();
        }

        let errors = std::mem::take(&mut *self.collected.lock());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors))
        }
    }

    fn run_scheduler(&self, trigger: &Receiver<()>, errors: &Sender<Error>) {
        loop {
            match trigger.recv_timeout(self.interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    if self.failed.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Err(e) = self.commit_pass() {
                        let _ = errors.send(e);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Runs one safe-commit pass. See the module docs for the protocol.
    fn commit_pass(&self) -> Result<()> {
        let units = self.units.lock().clone();
        if units.is_empty() {
            return Ok(());
        }

        let mut source_guards: Vec<(NodeId, &str, parking_lot::MutexGuard<'_, Box<dyn Source>>)> =
            Vec::new();
        let mut proc_guards: Vec<parking_lot::MutexGuard<'_, Box<dyn Processor>>> = Vec::new();

        for unit in &units {
            match unit {
                CommitUnit::Source { node, name, cell } => {
                    source_guards.push((*node, name.as_str(), cell.lock()));
                }
                CommitUnit::Processor { cell, buffer } => {
                    if let Some(buffer) = buffer {
                        self.wait_drained(buffer);
                    }
                    proc_guards.push(cell.lock());
                }
            }
        }

        // Committer hooks flush pending state before offsets advance.
        for guard in &mut proc_guards {
            if let Some(committer) = guard.as_committer() {
                committer.commit().map_err(Error::Commit)?;
            }
        }

        let marked = self.store.take_merged();
        for (source, token) in &marked {
            if let Some((_, name, guard)) = source_guards
                .iter_mut()
                .find(|(node, _, _)| *node == *source)
            {
                guard.commit(Some(token)).map_err(|e| Error::Source {
                    name: (*name).to_string(),
                    source: e,
                })?;
            }
        }

        if !marked.is_empty() {
            tracing::debug!("commit pass advanced {} source offset(s)", marked.len());
        }
        Ok(())
    }

    /// Waits for an async pump's inbound buffer to drain. Gives up if the
    /// buffer is closed (dead pump) or the task has failed; no commit
    /// happens on those paths.
    fn wait_drained(&self, buffer: &MessageBuffer) {
        let mut spins = 0_u32;
        while !buffer.is_empty() && !buffer.is_closed() && !self.failed.load(Ordering::Acquire) {
            backoff(&mut spins);
        }
    }
}

impl Supervisor for CommitSupervisor {
    fn commit(&self, _origin: NodeId) -> Result<()> {
        // Passes run on the scheduler thread: the requesting pump still
        // holds its own cell, so committing synchronously here would
        // deadlock the quiesce. The pass starts once current batches end.
        if let Some(trigger) = self.trigger_tx.lock().as_ref() {
            let _ = trigger.send(());
        }
        Ok(())
    }

    fn message_emitted(&self, source: NodeId) {
        if let Some(count) = self.inflight.read().get(&source) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn message_forked(&self, source: NodeId, copies: usize) {
        if let Some(count) = self.inflight.read().get(&source) {
            count.fetch_add(i64::try_from(copies).unwrap_or(i64::MAX), Ordering::AcqRel);
        }
    }

    fn message_done(&self, source: NodeId) {
        if let Some(count) = self.inflight.read().get(&source) {
            count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for CommitSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitSupervisor")
            .field("interval", &self.interval)
            .field("units", &self.units.lock().len())
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
