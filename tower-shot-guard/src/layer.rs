use std::fmt;
use std::sync::Arc;

use shot_guard::Engine;
use shot_guard::EntryType;
use shot_guard::ParamValue;
use tower::Layer;

use crate::service::GuardService;

pub(crate) type Extract<Req, T> = Arc<dyn Fn(&Req) -> T + Send + Sync>;

/// How requests map onto engine entries. Shared by every clone of the
/// service.
pub(crate) struct Guard<Req> {
    pub(crate) engine: Engine,
    pub(crate) resource: Extract<Req, String>,
    pub(crate) entry_type: EntryType,
    pub(crate) origin: Option<Extract<Req, String>>,
    pub(crate) args: Option<Extract<Req, Vec<ParamValue>>>,
}

/// Runs every request through the slot chain of a resource.
///
/// Requests are inbound entries by default, so system rules apply to them.
pub struct GuardLayer<Req> {
    guard: Guard<Req>,
}

impl<Req> Clone for Guard<Req> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            resource: Arc::clone(&self.resource),
            entry_type: self.entry_type,
            origin: self.origin.clone(),
            args: self.args.clone(),
        }
    }
}

impl<Req> Clone for GuardLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
        }
    }
}

impl<Req> fmt::Debug for GuardLayer<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardLayer")
            .field("engine", &self.guard.engine)
            .field("entry_type", &self.guard.entry_type)
            .finish()
    }
}

impl<Req> GuardLayer<Req> {
    /// Guards every request as the fixed resource `resource`.
    pub fn new(engine: Engine, resource: impl Into<String>) -> Self
    where
        Req: 'static,
    {
        let resource = resource.into();
        Self::with_resource_fn(engine, move |_req: &Req| resource.clone())
    }

    /// Names the resource from each request, e.g. from its route.
    pub fn with_resource_fn<F>(engine: Engine, resource: F) -> Self
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        GuardLayer {
            guard: Guard {
                engine,
                resource: Arc::new(resource),
                entry_type: EntryType::In,
                origin: None,
                args: None,
            },
        }
    }

    pub fn with_entry_type(mut self, entry_type: EntryType) -> Self {
        self.guard.entry_type = entry_type;
        self
    }

    /// Names the caller of each request, checked by authority rules and
    /// per-origin flow rules.
    pub fn with_origin<F>(mut self, origin: F) -> Self
    where
        F: Fn(&Req) -> String + Send + Sync + 'static,
    {
        self.guard.origin = Some(Arc::new(origin));
        self
    }

    /// Extracts the arguments hot-parameter rules look at.
    pub fn with_args<F>(mut self, args: F) -> Self
    where
        F: Fn(&Req) -> Vec<ParamValue> + Send + Sync + 'static,
    {
        self.guard.args = Some(Arc::new(args));
        self
    }
}

impl<Req, S> Layer<S> for GuardLayer<Req> {
    type Service = GuardService<S, Req>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService::new(service, self.guard.clone())
    }
}
