use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::warn;

use crate::node::DefaultNode;
use crate::node::EntranceNode;
use crate::node::ResourceWrapper;

/// A call chain: the named entrance, the caller origin and the entries that
/// are currently open on it.
///
/// Obtained from [`Engine::enter`](crate::Engine::enter) and handed to
/// [`EntryBuilder::with_context`](crate::EntryBuilder::with_context) for every
/// entry of the chain. Entries built without a context get a fresh one named
/// [`DEFAULT_CONTEXT_NAME`](crate::node::DEFAULT_CONTEXT_NAME).
#[derive(Debug)]
pub struct Context {
    name: String,
    origin: String,
    entrance: Option<Arc<EntranceNode>>,
    current: Mutex<Option<Arc<Frame>>>,
}

impl Context {
    pub(crate) fn new(
        name: impl Into<String>,
        origin: impl Into<String>,
        entrance: Option<Arc<EntranceNode>>,
    ) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            entrance,
            current: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The caller, e.g. an upstream application name. Empty when unknown.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn entrance(&self) -> Option<&Arc<EntranceNode>> {
        self.entrance.as_ref()
    }

    /// A context created past the context cap. Entries on it are not checked.
    pub fn is_null(&self) -> bool {
        self.entrance.is_none()
    }

    /// Number of entries currently open on this context.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut frame = self.current();
        while let Some(f) = frame {
            depth += 1;
            frame = f.parent.clone();
        }
        depth
    }

    pub(crate) fn current(&self) -> Option<Arc<Frame>> {
        self.current.lock().clone()
    }

    pub(crate) fn push(&self, frame: Arc<Frame>) {
        *self.current.lock() = Some(frame);
    }

    pub(crate) fn pop(&self, frame: &Arc<Frame>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|top| Arc::ptr_eq(top, frame)) {
            *current = frame.parent.clone();
        } else {
            warn!(
                context = %self.name,
                resource = %frame.resource,
                "entry exited out of order"
            );
        }
    }
}

/// One open entry's position in its context's stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) resource: ResourceWrapper,
    pub(crate) parent: Option<Arc<Frame>>,
    node: OnceLock<Arc<DefaultNode>>,
}

impl Frame {
    pub(crate) fn new(resource: ResourceWrapper, parent: Option<Arc<Frame>>) -> Self {
        Self {
            resource,
            parent,
            node: OnceLock::new(),
        }
    }

    pub(crate) fn node(&self) -> Option<Arc<DefaultNode>> {
        self.node.get().map(Arc::clone)
    }

    pub(crate) fn set_node(&self, node: Arc<DefaultNode>) {
        let _ = self.node.set(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EntryType;

    #[test]
    fn frames_stack_and_unwind() {
        let context = Context::new("ctx", "", Some(Arc::new(EntranceNode::new("ctx"))));
        let outer = Arc::new(Frame::new(ResourceWrapper::new("a", EntryType::In), None));
        context.push(Arc::clone(&outer));
        let inner = Arc::new(Frame::new(
            ResourceWrapper::new("b", EntryType::Out),
            context.current(),
        ));
        context.push(Arc::clone(&inner));
        assert_eq!(context.depth(), 2);

        // Out of order: ignored.
        context.pop(&outer);
        assert_eq!(context.depth(), 2);

        context.pop(&inner);
        context.pop(&outer);
        assert_eq!(context.depth(), 0);
    }
}
