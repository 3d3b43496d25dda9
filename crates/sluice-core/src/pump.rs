//! Pump execution units: one per topology node.
//!
//! An [`AsyncPump`] owns an inbound [`MessageBuffer`] and a runner thread
//! that drains it in batches; a [`SyncPump`] invokes its processor inline on
//! the calling pump's thread. Source nodes are driven by a [`SourcePump`]
//! thread looping over `consume`.
//!
//! Each pump takes its processor cell's lock for the span of a batch. The
//! supervisor quiesces the graph by acquiring those same cells in
//! topological order, so a locked-and-drained pump is guaranteed to hold no
//! in-flight work.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::buffer::{backoff, MessageBuffer};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::pipe::Pipe;
use crate::processor::{Processor, Source};
use crate::supervisor::Supervisor;
use crate::topology::NodeId;

/// Maximum number of messages an async pump drains per batch.
pub const BATCH_SIZE: usize = 100;

const RUNNING: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Entry point a parent pump (or pipe) uses to deliver a message.
pub trait Pump: Send + Sync {
    /// Delivers a message to this pump. Asynchronous pumps enqueue (and may
    /// park under backpressure); synchronous pumps process inline on the
    /// caller's execution unit.
    ///
    /// # Errors
    ///
    /// Synchronous pumps surface their processor's error to the caller.
    fn accept(&self, msg: Message) -> Result<()>;
}

/// Asynchronous pump: inbound buffer plus a dedicated runner thread.
pub struct AsyncPump {
    name: String,
    buffer: Arc<MessageBuffer>,
    cell: Arc<Mutex<Box<dyn Processor>>>,
    state: AtomicU8,
    runner: Mutex<Option<JoinHandle<()>>>,
    close_err: Mutex<Option<Error>>,
}

impl AsyncPump {
    /// Spawns the runner thread and returns the pump handle.
    pub(crate) fn spawn(
        name: String,
        buffer: Arc<MessageBuffer>,
        cell: Arc<Mutex<Box<dyn Processor>>>,
        pipe: Pipe,
        supervisor: Arc<dyn Supervisor>,
        errors: Sender<Error>,
    ) -> Arc<Self> {
        let pump = Arc::new(Self {
            name,
            buffer,
            cell,
            state: AtomicU8::new(RUNNING),
            runner: Mutex::new(None),
            close_err: Mutex::new(None),
        });

        let handle = {
            let pump = Arc::clone(&pump);
            thread::spawn(move || pump.run(&pipe, &supervisor, &errors))
        };
        *pump.runner.lock() = Some(handle);

        pump
    }

    /// Closes the inbound buffer, waits for the runner to drain and close
    /// the processor, and reports the processor's close error, if any.
    ///
    /// Idempotent: a second call returns immediately.
    ///
    /// # Errors
    ///
    /// Returns the processor's close error.
    pub(crate) fn stop(&self) -> Result<()> {
        self.buffer.close();
        let handle = self.runner.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("pump '{}' runner panicked", self.name);
            }
        }
        match self.close_err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn run(&self, pipe: &Pipe, supervisor: &Arc<dyn Supervisor>, errors: &Sender<Error>) {
        let mut batch: Vec<Message> = Vec::with_capacity(BATCH_SIZE);
        let mut spins = 0_u32;
        let terminal = pipe.is_terminal();

        'outer: loop {
            // Batches are taken under the processor lock: once the
            // supervisor holds the cell and sees an empty buffer, this pump
            // has no undelivered messages in hand.
            let mut processor = self.cell.lock();
            batch.clear();
            let n = self.buffer.read_into(&mut batch, BATCH_SIZE);
            if n == 0 {
                drop(processor);
                if self.buffer.done() || self.state.load(Ordering::Acquire) != RUNNING {
                    break;
                }
                backoff(&mut spins);
                continue;
            }
            spins = 0;

            for msg in batch.drain(..) {
                let source = msg.metadata().0;
                pipe.clock_start();
                let result = processor.process(msg);
                pipe.clock_stop();
                match result {
                    Ok(()) => {
                        if terminal {
                            if let Some(source) = source {
                                supervisor.message_done(source);
                            }
                        }
                    }
                    Err(e) => {
                        let err = Error::Processor {
                            node: self.name.clone(),
                            source: e,
                        };
                        tracing::error!("pump '{}' failed: {err}", self.name);
                        let _ = errors.send(err);
                        self.state.store(CLOSING, Ordering::Release);
                        self.buffer.close();
                        break 'outer;
                    }
                }
            }
        }

        if let Err(e) = self.cell.lock().close() {
            *self.close_err.lock() = Some(Error::Processor {
                node: self.name.clone(),
                source: e,
            });
        }
        self.state.store(CLOSED, Ordering::Release);
        tracing::debug!("pump '{}' closed", self.name);
    }
}

impl Pump for AsyncPump {
    fn accept(&self, msg: Message) -> Result<()> {
        self.buffer.write(msg);
        Ok(())
    }
}

impl std::fmt::Debug for AsyncPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPump")
            .field("name", &self.name)
            .field("buffered", &self.buffer.len())
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Synchronous pump: the processor runs inline on the caller's thread.
pub struct SyncPump {
    name: String,
    cell: Arc<Mutex<Box<dyn Processor>>>,
    pipe: Pipe,
    supervisor: Arc<dyn Supervisor>,
    state: AtomicU8,
}

impl SyncPump {
    pub(crate) fn new(
        name: String,
        cell: Arc<Mutex<Box<dyn Processor>>>,
        pipe: Pipe,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            name,
            cell,
            pipe,
            supervisor,
            state: AtomicU8::new(RUNNING),
        }
    }

    /// Closes the processor. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the processor's close error.
    pub(crate) fn stop(&self) -> Result<()> {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return Ok(());
        }
        self.cell.lock().close().map_err(|e| Error::Processor {
            node: self.name.clone(),
            source: e,
        })
    }
}

impl Pump for SyncPump {
    fn accept(&self, msg: Message) -> Result<()> {
        if self.state.load(Ordering::Acquire) != RUNNING {
            // Mirrors a closed buffer: late messages are dropped.
            return Ok(());
        }

        let source = msg.metadata().0;
        let terminal = self.pipe.is_terminal();
        let mut processor = self.cell.lock();
        self.pipe.clock_start();
        let result = processor.process(msg);
        self.pipe.clock_stop();

        match result {
            Ok(()) => {
                if terminal {
                    if let Some(source) = source {
                        self.supervisor.message_done(source);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.state.store(CLOSING, Ordering::Release);
                Err(Error::Processor {
                    node: self.name.clone(),
                    source: e,
                })
            }
        }
    }
}

impl std::fmt::Debug for SyncPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPump")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Drives one source: a thread looping `consume` → stamp provenance →
/// forward to the source node's children.
pub(crate) struct SourcePump {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SourcePump {
    /// Spawns the consume loop.
    pub(crate) fn spawn(
        name: String,
        node: NodeId,
        cell: Arc<Mutex<Box<dyn Source>>>,
        pipe: Pipe,
        supervisor: Arc<dyn Supervisor>,
        errors: Sender<Error>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let name = name.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                run_source(&name, node, &cell, &pipe, &supervisor, &errors, &shutdown);
            })
        };

        Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the consume loop to stop and joins it. Idempotent.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("source '{}' runner panicked", self.name);
            }
        }
    }
}

fn run_source(
    name: &str,
    node: NodeId,
    cell: &Arc<Mutex<Box<dyn Source>>>,
    pipe: &Pipe,
    supervisor: &Arc<dyn Supervisor>,
    errors: &Sender<Error>,
    shutdown: &AtomicBool,
) {
    let mut spins = 0_u32;

    while !shutdown.load(Ordering::Acquire) {
        // The cell stays locked across consume + forward so the supervisor
        // can quiesce this source by holding the cell.
        let mut source = cell.lock();
        let msg = match source.consume() {
            Ok(msg) => msg,
            Err(e) => {
                let err = Error::Source {
                    name: name.to_string(),
                    source: e,
                };
                tracing::error!("source '{name}' failed: {err}");
                let _ = errors.send(err);
                break;
            }
        };

        if msg.is_empty() {
            drop(source);
            backoff(&mut spins);
            continue;
        }
        spins = 0;

        let mut msg = msg;
        msg.stamp_source(node);
        if msg.metadata().0.is_some() {
            supervisor.message_emitted(node);
        }

        let result = pipe.forward(msg);
        drop(source);
        if let Err(err) = result {
            tracing::error!("source '{name}' forward failed: {err}");
            let _ = errors.send(err);
            break;
        }
    }

    tracing::debug!("source '{name}' stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::error::BoxError;
    use crate::metastore::InMemoryMetastore;

    #[derive(Default)]
    struct NullSupervisor;

    impl Supervisor for NullSupervisor {
        fn commit(&self, _origin: NodeId) -> Result<()> {
            Ok(())
        }
    }

    /// Collects processed values; fails on a designated poison value.
    struct Recording {
        seen: Arc<Mutex<Vec<i64>>>,
        closed: Arc<AtomicBool>,
        poison: Option<i64>,
    }

    impl Processor for Recording {
        fn with_pipe(&mut self, _pipe: Pipe) {}

        fn process(&mut self, msg: Message) -> std::result::Result<(), BoxError> {
            let value = *msg.value_as::<i64>().unwrap();
            if self.poison == Some(value) {
                return Err("poisoned".into());
            }
            self.seen.lock().push(value);
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), BoxError> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn recording(
        poison: Option<i64>,
    ) -> (Arc<Mutex<Vec<i64>>>, Arc<AtomicBool>, Box<dyn Processor>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let processor = Box::new(Recording {
            seen: Arc::clone(&seen),
            closed: Arc::clone(&closed),
            poison,
        });
        (seen, closed, processor)
    }

    fn terminal_pipe() -> Pipe {
        Pipe::new(
            Arc::new(InMemoryMetastore::new()),
            Arc::new(NullSupervisor),
            NodeId(1),
            Vec::new(),
        )
    }

    #[test]
    fn test_async_pump_processes_accepted_messages() {
        let (seen, closed, processor) = recording(None);
        let buffer = Arc::new(MessageBuffer::new(16));
        let (tx, _rx) = mpsc::channel();
        let pump = AsyncPump::spawn(
            "test".to_string(),
            Arc::clone(&buffer),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
            tx,
        );

        for i in 0..50_i64 {
            pump.accept(Message::of(i)).unwrap();
        }
        pump.stop().unwrap();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        assert!(closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_async_pump_stop_is_idempotent() {
        let (_, _, processor) = recording(None);
        let (tx, _rx) = mpsc::channel();
        let pump = AsyncPump::spawn(
            "test".to_string(),
            Arc::new(MessageBuffer::new(16)),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
            tx,
        );

        pump.stop().unwrap();
        pump.stop().unwrap();
    }

    #[test]
    fn test_async_pump_reports_processor_error() {
        let (seen, _, processor) = recording(Some(3));
        let buffer = Arc::new(MessageBuffer::new(16));
        let (tx, rx) = mpsc::channel();
        let pump = AsyncPump::spawn(
            "bad".to_string(),
            Arc::clone(&buffer),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
            tx,
        );

        for i in 0..5_i64 {
            pump.accept(Message::of(i)).unwrap();
        }

        let err = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(matches!(err, Error::Processor { ref node, .. } if node == "bad"));
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        pump.stop().unwrap();
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_sync_pump_processes_inline() {
        let (seen, closed, processor) = recording(None);
        let pump = SyncPump::new(
            "inline".to_string(),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
        );

        pump.accept(Message::of(1_i64)).unwrap();
        pump.accept(Message::of(2_i64)).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        pump.stop().unwrap();
        assert!(closed.load(Ordering::Acquire));

        // Late messages are dropped after stop.
        pump.accept(Message::of(3_i64)).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_sync_pump_surfaces_error_to_caller() {
        let (_, _, processor) = recording(Some(2));
        let pump = SyncPump::new(
            "inline".to_string(),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
        );

        pump.accept(Message::of(1_i64)).unwrap();
        let result = pump.accept(Message::of(2_i64));
        assert!(matches!(result, Err(Error::Processor { .. })));
    }

    struct CountingSource {
        next: i64,
        limit: i64,
    }

    impl Source for CountingSource {
        fn consume(&mut self) -> std::result::Result<Message, BoxError> {
            if self.next >= self.limit {
                return Ok(Message::new(None, None));
            }
            let value = self.next;
            self.next += 1;
            Ok(Message::of(value))
        }

        fn commit(
            &mut self,
            _token: Option<&Arc<dyn crate::message::Metadata>>,
        ) -> std::result::Result<(), BoxError> {
            Ok(())
        }

        fn close(&mut self) -> std::result::Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn test_source_pump_feeds_children() {
        let (seen, _, processor) = recording(None);
        let buffer = Arc::new(MessageBuffer::new(16));
        let (tx, _rx) = mpsc::channel();
        let sink = AsyncPump::spawn(
            "sink".to_string(),
            Arc::clone(&buffer),
            Arc::new(Mutex::new(processor)),
            terminal_pipe(),
            Arc::new(NullSupervisor),
            tx.clone(),
        );

        let store: Arc<InMemoryMetastore> = Arc::new(InMemoryMetastore::new());
        let pipe = Pipe::new(
            store,
            Arc::new(NullSupervisor),
            NodeId(0),
            vec![Arc::clone(&sink) as Arc<dyn Pump>],
        );
        let cell: Arc<Mutex<Box<dyn Source>>> =
            Arc::new(Mutex::new(Box::new(CountingSource { next: 0, limit: 20 })));
        let source = SourcePump::spawn(
            "src".to_string(),
            NodeId(0),
            cell,
            pipe,
            Arc::new(NullSupervisor),
            tx,
        );

        // Wait for everything to flow through.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while seen.lock().len() < 20 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }

        source.stop();
        sink.stop().unwrap();

        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }
}
