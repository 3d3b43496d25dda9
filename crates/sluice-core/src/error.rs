//! Error types for the runtime engine.

/// Boxed error type returned by user-provided sources, processors, and
/// committers. Applications can use any error type that satisfies the bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by topology construction and runtime execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A processor's `process` or `close` failed. Fatal for its pump.
    #[error("processor '{node}' failed: {source}")]
    Processor {
        /// Name of the topology node whose processor failed.
        node: String,
        /// The underlying processor error.
        #[source]
        source: BoxError,
    },

    /// A source's `consume`, `commit`, or `close` failed. Fatal for the task.
    #[error("source '{name}' failed: {source}")]
    Source {
        /// Name of the source node.
        name: String,
        /// The underlying source error.
        #[source]
        source: BoxError,
    },

    /// A committer hook failed during a commit pass.
    #[error("commit failed: {0}")]
    Commit(#[source] BoxError),

    /// Recording a source-metadata token in the metastore failed.
    #[error("mark failed: {0}")]
    Mark(#[source] BoxError),

    /// `forward_to_child` was called with an out-of-range child index.
    #[error("child index {index} out of range ({len} children)")]
    IndexOutOfRange {
        /// The requested child index.
        index: usize,
        /// Number of children the pipe actually has.
        len: usize,
    },

    /// `Task::start` was called more than once.
    #[error("task already started")]
    AlreadyStarted,

    /// `Task::start` was called on a closed task.
    #[error("task is closed")]
    TaskClosed,

    /// A node with the same name already exists in the topology.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// An edge references a node that does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The topology contains a cycle involving the named node.
    #[error("cycle detected involving node: {0}")]
    CycleDetected(String),

    /// The topology has no nodes.
    #[error("empty topology: no nodes")]
    EmptyTopology,

    /// An edge points into a source node.
    #[error("source '{0}' cannot have an upstream edge")]
    SourceHasParent(String),

    /// Errors collected during orderly shutdown. The first fatal error has
    /// already been reported once through the error callback; the full set
    /// is returned from `Task::close`.
    #[error("shutdown completed with {} error(s)", .0.len())]
    Shutdown(Vec<Error>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::IndexOutOfRange { index: 3, len: 1 };
        assert_eq!(err.to_string(), "child index 3 out of range (1 children)");

        let err = Error::DuplicateNode("map".to_string());
        assert_eq!(err.to_string(), "duplicate node name: map");

        let err = Error::Shutdown(vec![Error::AlreadyStarted, Error::EmptyTopology]);
        assert_eq!(err.to_string(), "shutdown completed with 2 error(s)");
    }

    #[test]
    fn test_source_chain() {
        let inner: BoxError = "disk unplugged".into();
        let err = Error::Processor {
            node: "sink".to_string(),
            source: inner,
        };
        assert!(err.to_string().contains("sink"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
