//! Task lifecycle façade: wires the topology into pumps and buffers,
//! starts sources, and drives orderly shutdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_core::{Task, TaskConfig, Topology};
//!
//! let mut topology = Topology::new();
//! let src = topology.add_source("numbers", Box::new(NumberSource::new()))?;
//! let filter = topology.add_processor("filter", Box::new(LowPass::new(50)))?;
//! let print = topology.add_processor("print", Box::new(Print))?;
//! topology.connect(src, filter)?;
//! topology.connect(filter, print)?;
//!
//! let task = Task::new(topology)?;
//! task.on_error(|err| eprintln!("stream failed: {err}"));
//! task.start()?;
//! // ...
//! task.close()?;
//! ```

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::buffer::MessageBuffer;
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::metastore::{InMemoryMetastore, Metastore};
use crate::pipe::Pipe;
use crate::processor::Source;
use crate::pump::{AsyncPump, Pump, SourcePump, SyncPump};
use crate::supervisor::{CommitSupervisor, CommitUnit, Supervisor};
use crate::topology::{Mode, NodeId, NodeKind, Topology};

/// Lifecycle state of a task. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Built, not yet started.
    Created,
    /// Pumps and sources are running.
    Running,
    /// Shutdown in progress.
    Closing,
    /// Fully shut down.
    Closed,
}

/// Concrete pump handle, kept for lifecycle control in topological order.
enum PumpHandle {
    Async(Arc<AsyncPump>),
    Sync(Arc<SyncPump>),
}

/// A running source: the consume loop plus the cell used for `close`.
struct SourceUnit {
    name: String,
    pump: SourcePump,
    cell: Arc<Mutex<Box<dyn Source>>>,
}

/// Executes a built topology with one pump per node.
pub struct Task {
    config: TaskConfig,
    state: Mutex<TaskState>,
    topology: Mutex<Option<Topology>>,
    store: Arc<InMemoryMetastore>,
    supervisor: Arc<CommitSupervisor>,
    /// Pumps in topological order (upstream first), for shutdown.
    pumps: Mutex<Vec<PumpHandle>>,
    sources: Mutex<Vec<SourceUnit>>,
}

impl Task {
    /// Creates a task over `topology` with the default configuration,
    /// finalizing the topology if the application has not already done so.
    ///
    /// # Errors
    ///
    /// Returns topology validation errors.
    pub fn new(topology: Topology) -> Result<Self> {
        Self::with_config(topology, TaskConfig::default())
    }

    /// Creates a task with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns topology validation errors.
    pub fn with_config(mut topology: Topology, config: TaskConfig) -> Result<Self> {
        if !topology.is_finalized() {
            topology.finalize()?;
        }

        let store = Arc::new(InMemoryMetastore::new());
        let supervisor = Arc::new(CommitSupervisor::new(
            Arc::clone(&store) as Arc<dyn Metastore>,
            config.commit_interval,
        ));

        Ok(Self {
            config,
            state: Mutex::new(TaskState::Created),
            topology: Mutex::new(Some(topology)),
            store,
            supervisor,
            pumps: Mutex::new(Vec::new()),
            sources: Mutex::new(Vec::new()),
        })
    }

    /// Installs the error callback, invoked once for the first fatal error
    /// from any pump or source.
    pub fn on_error<F>(&self, callback: F)
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.supervisor.on_error(callback);
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Returns the number of provenance-carrying messages from `source`
    /// still live in the graph.
    #[must_use]
    pub fn inflight(&self, source: NodeId) -> i64 {
        self.supervisor.inflight(source)
    }

    /// Materializes pumps and buffers, starts the supervisor and all pumps,
    /// then starts all sources. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call and
    /// [`Error::TaskClosed`] after `close`.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Created => *state = TaskState::Running,
                TaskState::Running => return Err(Error::AlreadyStarted),
                TaskState::Closing | TaskState::Closed => return Err(Error::TaskClosed),
            }
        }

        let Some(topology) = self.topology.lock().take() else {
            return Err(Error::AlreadyStarted);
        };
        let node_count = topology.node_count();
        let (mut nodes, order) = topology.into_parts();

        CommitSupervisor::start(&self.supervisor);
        let errors = self.supervisor.error_sender();
        let supervisor = Arc::clone(&self.supervisor) as Arc<dyn Supervisor>;
        let store = Arc::clone(&self.store) as Arc<dyn Metastore>;
        let capacity = self.config.effective_buffer_size();

        let mut accepts: FxHashMap<NodeId, Arc<dyn Pump>> = FxHashMap::default();
        let mut registrations: FxHashMap<NodeId, CommitUnit> = FxHashMap::default();
        let mut pumps: Vec<PumpHandle> = Vec::new();
        let mut sources: Vec<SourceUnit> = Vec::new();

        // Children first: by the time a node's pump spawns, every pump it
        // forwards to is already running. Sources have no parents, so they
        // come last and start after all processor pumps; reverse
        // topological order gives both properties at once.
        for &id in order.iter().rev() {
            let Some(node) = nodes.remove(&id) else {
                continue;
            };

            let children: Vec<Arc<dyn Pump>> = node
                .children
                .iter()
                .filter_map(|child| accepts.get(child).cloned())
                .collect();
            let pipe = Pipe::new(Arc::clone(&store), Arc::clone(&supervisor), id, children);

            match node.kind {
                NodeKind::Source(source) => {
                    let cell = Arc::new(Mutex::new(source));
                    let pump = SourcePump::spawn(
                        node.name.clone(),
                        id,
                        Arc::clone(&cell),
                        pipe,
                        Arc::clone(&supervisor),
                        errors.clone(),
                    );
                    registrations.insert(
                        id,
                        CommitUnit::Source {
                            node: id,
                            name: node.name.clone(),
                            cell: Arc::clone(&cell),
                        },
                    );
                    sources.push(SourceUnit {
                        name: node.name,
                        pump,
                        cell,
                    });
                }
                NodeKind::Processor(mut processor) => {
                    processor.with_pipe(pipe.clone());
                    let cell = Arc::new(Mutex::new(processor));

                    match node.mode {
                        Mode::Async => {
                            let buffer = Arc::new(if node.parent_count > 1 {
                                MessageBuffer::with_shared_writers(capacity)
                            } else {
                                MessageBuffer::new(capacity)
                            });
                            let pump = AsyncPump::spawn(
                                node.name.clone(),
                                Arc::clone(&buffer),
                                Arc::clone(&cell),
                                pipe,
                                Arc::clone(&supervisor),
                                errors.clone(),
                            );
                            accepts.insert(id, Arc::clone(&pump) as Arc<dyn Pump>);
                            registrations.insert(
                                id,
                                CommitUnit::Processor {
                                    cell,
                                    buffer: Some(buffer),
                                },
                            );
                            pumps.push(PumpHandle::Async(pump));
                        }
                        Mode::Sync => {
                            let pump = Arc::new(SyncPump::new(
                                node.name.clone(),
                                Arc::clone(&cell),
                                pipe,
                                Arc::clone(&supervisor),
                            ));
                            accepts.insert(id, Arc::clone(&pump) as Arc<dyn Pump>);
                            registrations
                                .insert(id, CommitUnit::Processor { cell, buffer: None });
                            pumps.push(PumpHandle::Sync(pump));
                        }
                    }
                }
            }
        }

        // The supervisor quiesces units in topological order.
        for id in &order {
            if let Some(unit) = registrations.remove(id) {
                self.supervisor.register(unit);
            }
        }

        pumps.reverse();
        *self.pumps.lock() = pumps;
        *self.sources.lock() = sources;

        tracing::debug!("task started: {node_count} node(s)");
        Ok(())
    }

    /// Orderly shutdown: sources first, then pumps in topological order,
    /// then the supervisor (which attempts a final commit pass on clean
    /// shutdown). Idempotent: a second call returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] aggregating every error encountered,
    /// including any fatal error already reported through the callback.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Closing | TaskState::Closed => return Ok(()),
                TaskState::Created => {
                    *state = TaskState::Closed;
                    return Ok(());
                }
                TaskState::Running => *state = TaskState::Closing,
            }
        }

        let mut errors: Vec<Error> = Vec::new();

        let sources = std::mem::take(&mut *self.sources.lock());
        for unit in &sources {
            unit.pump.stop();
        }
        for unit in &sources {
            if let Err(e) = unit.cell.lock().close() {
                errors.push(Error::Source {
                    name: unit.name.clone(),
                    source: e,
                });
            }
        }

        let pumps = std::mem::take(&mut *self.pumps.lock());
        for pump in &pumps {
            let result = match pump {
                PumpHandle::Async(pump) => pump.stop(),
                PumpHandle::Sync(pump) => pump.stop(),
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }

        match self.supervisor.close() {
            Ok(()) => {}
            Err(Error::Shutdown(mut collected)) => errors.append(&mut collected),
            Err(e) => errors.push(e),
        }

        *self.state.lock() = TaskState::Closed;
        tracing::debug!("task closed");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors))
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
