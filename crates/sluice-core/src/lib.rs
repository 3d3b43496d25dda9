//! # Sluice Core
//!
//! Runtime execution engine for DAG stream processing.
//!
//! Applications declare a [`Topology`], a directed acyclic graph of
//! sources and processors, and hand it to a [`Task`], which executes it
//! with controlled concurrency, at-least-once delivery, and coordinated
//! commit of source offsets:
//!
//! - **Pumps**: one execution unit per node, draining a bounded
//!   [`MessageBuffer`] in batches (or running inline for sync nodes)
//! - **Pipes**: per-node forward / mark / commit primitive with
//!   own-processor timing
//! - **Supervisor**: quiesce-based commit coordinator and error arbiter
//! - **Backpressure**: a full buffer parks its writer, cascading to sources
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_core::{Task, Topology};
//!
//! let mut topology = Topology::new();
//! let src = topology.add_source("trades", Box::new(KafkaSource::new(cfg)))?;
//! let dedup = topology.add_processor("dedup", Box::new(Dedup::default()))?;
//! let sink = topology.add_processor("sink", Box::new(Warehouse::new(dsn)))?;
//! topology.connect(src, dedup)?;
//! topology.connect(dedup, sink)?;
//!
//! let task = Task::new(topology)?;
//! task.on_error(|err| tracing::error!("stream failed: {err}"));
//! task.start()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the buffer ring; every block carries a SAFETY note.
#![allow(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod message;
pub mod metastore;
pub mod pipe;
pub mod processor;
pub mod pump;
pub mod supervisor;
pub mod task;
pub mod topology;


pub use buffer::MessageBuffer;
pub use config::TaskConfig;
pub use error::{BoxError, Error, Result};
pub use message::{Context, Message, Metadata, Value};
pub use metastore::{InMemoryMetastore, Metastore};
pub use pipe::Pipe;
pub use processor::{Committer, Processor, Source};
pub use pump::{Pump, BATCH_SIZE};
pub use supervisor::{CommitSupervisor, Supervisor};
pub use task::{Task, TaskState};
pub use topology::{Mode, NodeId, Topology, TopologyNode};
