use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use shot_guard::CancelToken;
use shot_guard::Engine;
use shot_guard::Entry;
use shot_guard::EntryType;
use shot_guard::ParamValue;
use tower::BoxError;
use tower::Service;
use tracing::debug;

use crate::error::GuardError;
use crate::layer::Guard;

/// The future returned by [`GuardService`].
pub type ResponseFuture<T> = Pin<Box<dyn Future<Output = Result<T, GuardError>> + Send>>;

/// Cancels queued waits of an entry whose request was dropped.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Wraps `S` in an entry/exit pair of the engine.
///
/// The entry is built on tokio's blocking pool, since pacing controllers may
/// park the thread that asks. A failed inner call marks the entry as an
/// exception before it exits.
pub struct GuardService<S, Req> {
    inner: S,
    guard: Arc<Guard<Req>>,
}

impl<S: Clone, Req> Clone for GuardService<S, Req> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<S: fmt::Debug, Req> fmt::Debug for GuardService<S, Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardService")
            .field("inner", &self.inner)
            .field("engine", &self.guard.engine)
            .finish()
    }
}

impl<S, Req> GuardService<S, Req> {
    pub(crate) fn new(inner: S, guard: Guard<Req>) -> Self {
        Self {
            inner,
            guard: Arc::new(guard),
        }
    }
}

/// What the engine needs to know about one request.
struct Call {
    resource: String,
    origin: String,
    args: Vec<ParamValue>,
}

impl Call {
    fn of<Req>(guard: &Guard<Req>, req: &Req) -> Self {
        Self {
            resource: (guard.resource)(req),
            origin: guard.origin.as_ref().map(|f| f(req)).unwrap_or_default(),
            args: guard.args.as_ref().map(|f| f(req)).unwrap_or_default(),
        }
    }

    async fn admit(self, engine: Engine, entry_type: EntryType, cancel: CancelToken) -> Result<Entry, GuardError> {
        let admitted = tokio::task::spawn_blocking(move || {
            let context = engine.enter(&self.resource, &self.origin);
            engine
                .entry(self.resource)
                .with_entry_type(entry_type)
                .with_args(self.args)
                .with_context(&context)
                .with_cancel(cancel)
                .build()
        })
        .await;

        match admitted {
            Ok(Ok(entry)) => Ok(entry),
            Ok(Err(blocked)) => {
                debug!(resource = blocked.resource(), reason = %blocked.reason(), "request blocked");
                Err(GuardError::Blocked(blocked))
            }
            Err(join) => Err(GuardError::Internal(join.to_string())),
        }
    }
}

impl<S, Req> Service<Req> for GuardService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError;
    type Future = ResponseFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|e| {
                let e: BoxError = e.into();
                GuardError::Inner(e.to_string())
            })
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let call = Call::of(&self.guard, &req);
        let engine = self.guard.engine.clone();
        let entry_type = self.guard.entry_type;

        Box::pin(async move {
            let cancel = CancelOnDrop(CancelToken::new());
            let mut entry = call.admit(engine, entry_type, cancel.0.clone()).await?;

            match inner.call(req).await {
                Ok(response) => {
                    entry.exit();
                    Ok(response)
                }
                Err(err) => {
                    let err: BoxError = err.into();
                    entry.set_error(err.to_string());
                    entry.exit();
                    Err(GuardError::Inner(err.to_string()))
                }
            }
        })
    }
}
