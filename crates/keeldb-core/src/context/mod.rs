pub mod tenant;

use crate::{batch::BatchScheduler, cache::InstanceCache, types::TenantId};
use std::sync::{Arc, Mutex};

tokio::task_local! {
    static CURRENT: RequestContext;
}

///
/// ContextOptions
///

#[derive(Clone, Debug, Default)]
pub struct ContextOptions {
    /// Tenant override. `None` inherits the enclosing context's tenant.
    pub tenant: Option<TenantId>,
}

impl ContextOptions {
    #[must_use]
    pub fn with_tenant(tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: Some(tenant.into()),
        }
    }
}

///
/// RequestContext
///
/// Scoped ambient bundle of (tenant, scheduler, cache) governing one
/// logical unit of work. Established around an async body; every
/// persistence operation awaited inside observes it, and nothing can read
/// it after the body returns. Nested contexts get a fresh scheduler and
/// cache so concurrent nested work never sees a sibling's state.
///

#[derive(Clone, Debug)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    tenant: Mutex<Option<TenantId>>,
    scheduler: BatchScheduler,
    cache: Arc<InstanceCache>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // resolves any stranded scheduler entries with CanceledError
        self.scheduler.shutdown();
    }
}

impl RequestContext {
    fn new(tenant: Option<TenantId>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                tenant: Mutex::new(tenant),
                scheduler: BatchScheduler::new(),
                cache: Arc::new(InstanceCache::new()),
            }),
        }
    }

    /// The ambient context of the running task, if one is established.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Run `body` inside a fresh request context.
    pub async fn run<F>(body: F) -> F::Output
    where
        F: Future,
    {
        Self::run_with(ContextOptions::default(), body).await
    }

    /// Run `body` inside a fresh request context with explicit options.
    /// The tenant is inherited from any enclosing context unless
    /// overridden.
    pub async fn run_with<F>(options: ContextOptions, body: F) -> F::Output
    where
        F: Future,
    {
        let inherited = Self::current().and_then(|ctx| ctx.tenant());
        let context = Self::new(options.tenant.or(inherited));

        let output = CURRENT.scope(context.clone(), body).await;

        // teardown before returning control: pending batch entries must
        // not outlive the scope that owns them
        context.inner.scheduler.shutdown();
        context.inner.cache.clear();

        output
    }

    #[must_use]
    pub fn tenant(&self) -> Option<TenantId> {
        self.inner.tenant.lock().expect("context lock").clone()
    }

    pub fn set_tenant(&self, tenant: Option<TenantId>) {
        *self.inner.tenant.lock().expect("context lock") = tenant;
    }

    #[must_use]
    pub(crate) fn scheduler(&self) -> &BatchScheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub(crate) fn cache(&self) -> &Arc<InstanceCache> {
        &self.inner.cache
    }
}
