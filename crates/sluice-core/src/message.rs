//! Message envelope and source-metadata tokens.
//!
//! A [`Message`] is the unit of data flowing through the graph: a context
//! handle, an optional key, an optional value, and provenance (the source
//! node that produced it plus an opaque [`Metadata`] token, e.g. a
//! partition/offset pair). Payloads are dynamically typed; processors
//! downcast at their boundaries via [`Message::value_as`] / [`Message::key_as`].
//!
//! Cloning a message is logical, not a deep copy: payloads and context are
//! reference-counted, so fan-out to multiple children is cheap.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::topology::NodeId;

/// Dynamically typed payload slot for message keys and values.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Opaque source-metadata token carried by messages for commit accounting.
///
/// A source supplies a token alongside each produced message. The runtime
/// never inspects tokens; it keeps the greatest-so-far per (processor,
/// source) by folding newer tokens over older ones with [`merge`](Self::merge).
pub trait Metadata: fmt::Debug + Send + Sync + 'static {
    /// Folds this token with a previously recorded one, returning whichever
    /// is greater under the source's own ordering.
    fn merge(&self, prev: &Arc<dyn Metadata>) -> Arc<dyn Metadata>;

    /// Downcast support, used by sources to interpret their own tokens at
    /// commit time.
    fn as_any(&self) -> &dyn Any;
}

/// Node of the immutable context chain.
struct ContextNode {
    key: TypeId,
    value: Value,
    parent: Option<Arc<ContextNode>>,
}

/// Immutable carrier for cross-cutting values, keyed by Rust type.
///
/// Deriving a context with [`with_value`](Self::with_value) shares the parent
/// chain, so contexts are cheap to clone and thread through the graph.
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<ContextNode>>,
}

impl Context {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a derived context carrying `value`, shadowing any previous
    /// value of the same type.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(ContextNode {
                key: TypeId::of::<T>(),
                value: Arc::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// Looks up a value of type `T`, walking from the most recently added.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            if node.key == TypeId::of::<T>() {
                return node.value.downcast_ref::<T>();
            }
            cur = node.parent.as_deref();
        }
        None
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            depth += 1;
            cur = node.parent.as_deref();
        }
        f.debug_struct("Context").field("depth", &depth).finish()
    }
}

/// The value envelope flowing through the graph.
#[derive(Clone)]
pub struct Message {
    context: Context,
    key: Option<Value>,
    value: Option<Value>,
    source: Option<NodeId>,
    token: Option<Arc<dyn Metadata>>,
}

impl Message {
    /// Creates a message with an empty context.
    #[must_use]
    pub fn new(key: Option<Value>, value: Option<Value>) -> Self {
        Self::with_context(Context::new(), key, value)
    }

    /// Creates a message carrying the given context.
    #[must_use]
    pub fn with_context(context: Context, key: Option<Value>, value: Option<Value>) -> Self {
        Self {
            context,
            key,
            value,
            source: None,
            token: None,
        }
    }

    /// Creates a keyless message from a typed value.
    #[must_use]
    pub fn of<V: Any + Send + Sync>(value: V) -> Self {
        Self::new(None, Some(Arc::new(value)))
    }

    /// Creates a message from a typed key and value.
    #[must_use]
    pub fn keyed<K: Any + Send + Sync, V: Any + Send + Sync>(key: K, value: V) -> Self {
        Self::new(Some(Arc::new(key)), Some(Arc::new(value)))
    }

    /// Returns a new envelope with the value replaced, keeping the key,
    /// context, and provenance. This is how mapping processors rewrite
    /// payloads without losing commit accounting.
    #[must_use]
    pub fn with_value(mut self, value: Option<Value>) -> Self {
        self.value = value;
        self
    }

    /// Returns a new envelope with the key replaced, keeping everything else.
    #[must_use]
    pub fn with_key(mut self, key: Option<Value>) -> Self {
        self.key = key;
        self
    }

    /// Returns a new envelope with provenance set to (`source`, `token`).
    ///
    /// This is the single metadata association a message receives; the
    /// runtime uses it for commit accounting.
    #[must_use]
    pub fn with_metadata(mut self, source: NodeId, token: Arc<dyn Metadata>) -> Self {
        self.source = Some(source);
        self.token = Some(token);
        self
    }

    /// Returns a new envelope carrying only the metadata token.
    ///
    /// Intended for sources, which do not know their own node id: the
    /// runtime stamps the originating node when the message enters the graph.
    #[must_use]
    pub fn with_token(mut self, token: Arc<dyn Metadata>) -> Self {
        self.token = Some(token);
        self
    }

    /// Binds the originating source node to a message that already carries
    /// a token. No-op if the message has no token or is already bound.
    pub(crate) fn stamp_source(&mut self, source: NodeId) {
        if self.token.is_some() && self.source.is_none() {
            self.source = Some(source);
        }
    }

    /// True iff both key and value are absent. Sources return an empty
    /// message to signal that no data is currently available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }

    /// Returns the message context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the raw key slot.
    #[must_use]
    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Returns the raw value slot.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Downcasts the key to `T`.
    #[must_use]
    pub fn key_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.key.as_ref()?.downcast_ref::<T>()
    }

    /// Downcasts the value to `T`.
    #[must_use]
    pub fn value_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    /// Returns the provenance pair: originating source node and token.
    #[must_use]
    pub fn metadata(&self) -> (Option<NodeId>, Option<&Arc<dyn Metadata>>) {
        (self.source, self.token.as_ref())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("has_key", &self.key.is_some())
            .field("has_value", &self.value.is_some())
            .field("source", &self.source)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}
