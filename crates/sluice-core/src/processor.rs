//! Capabilities the runtime consumes from user code.
//!
//! Applications implement [`Source`] for nodes that produce messages and
//! [`Processor`] for nodes that transform or consume them. Implementations
//! are invoked by at most one execution unit at a time, so they can hold
//! mutable state without internal locking.

use std::sync::Arc;

use crate::error::BoxError;
use crate::message::{Message, Metadata};
use crate::pipe::Pipe;

/// A node with no inbound edge: produces messages for the graph.
pub trait Source: Send {
    /// Pulls the next message. Blocking is allowed, but implementations
    /// should return an empty message promptly when no data is available:
    /// a source that blocks indefinitely also stalls commit passes.
    ///
    /// Messages that should participate in offset commits carry a metadata
    /// token ([`Message::with_token`]); the runtime stamps the originating
    /// node and tracks the greatest token seen per downstream processor.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the whole task.
    fn consume(&mut self) -> Result<Message, BoxError>;

    /// Advances the source's durable offset to `token`, the greatest token
    /// marked across all processors since the last commit pass. Called by
    /// the supervisor with all pumps quiesced.
    ///
    /// # Errors
    ///
    /// Any error aborts the commit pass and is fatal for the task.
    fn commit(&mut self, token: Option<&Arc<dyn Metadata>>) -> Result<(), BoxError>;

    /// Releases source resources during orderly shutdown.
    ///
    /// # Errors
    ///
    /// Errors are aggregated into the shutdown result.
    fn close(&mut self) -> Result<(), BoxError>;
}

/// A node that handles messages and forwards results through its pipe.
pub trait Processor: Send {
    /// Hands the processor its pipe before the task starts. Processors keep
    /// the pipe and use it inside [`process`](Self::process) to forward,
    /// mark, or commit.
    fn with_pipe(&mut self, pipe: Pipe);

    /// Handles one message.
    ///
    /// # Errors
    ///
    /// Any error is fatal for this node's pump and surfaces through the
    /// task's error callback.
    fn process(&mut self, msg: Message) -> Result<(), BoxError>;

    /// Releases processor resources after the pump has drained.
    ///
    /// # Errors
    ///
    /// Errors are aggregated into the shutdown result.
    fn close(&mut self) -> Result<(), BoxError>;

    /// Capability seam: processors that participate in commit passes return
    /// themselves here. The default implementation opts out.
    fn as_committer(&mut self) -> Option<&mut dyn Committer> {
        None
    }
}

/// Optional processor capability invoked during supervisor commit passes.
///
/// Typical implementations flush buffered writes so that committing source
/// offsets never acknowledges data the processor is still holding.
pub trait Committer {
    /// Flushes pending state ahead of the source offset commits.
    ///
    /// # Errors
    ///
    /// Any error aborts the commit pass.
    fn commit(&mut self) -> Result<(), BoxError>;
}
