use crate::{
    config::Config,
    context::{ContextOptions, RequestContext},
    error::Error,
    key,
    types::TenantId,
};
use std::sync::Arc;

///
/// Tenant layer
///
/// The ambient tenant id lives inside the request context. When tenancy is
/// disabled the key codec substitutes the `no-tenant` literal and nothing
/// here is consulted; keys are not portable across that switch.
///

///
/// TenantResolver
///
/// Zero-argument producer consulted, in registration order, when no
/// explicit tenant is set on the active context.
///

pub trait TenantResolver: Send + Sync {
    fn resolve(&self) -> Option<TenantId>;
}

impl<F> TenantResolver for F
where
    F: Fn() -> Option<TenantId> + Send + Sync,
{
    fn resolve(&self) -> Option<TenantId> {
        self()
    }
}

/// Explicitly set the ambient tenant on the active context.
pub fn set_current(tenant: impl Into<TenantId>) -> Result<(), Error> {
    let context = RequestContext::current().ok_or(Error::Context {
        operation: "tenant.set_current",
    })?;
    context.set_tenant(Some(tenant.into()));

    Ok(())
}

/// Clear the ambient tenant on the active context.
pub fn clear() -> Result<(), Error> {
    let context = RequestContext::current().ok_or(Error::Context {
        operation: "tenant.clear",
    })?;
    context.set_tenant(None);

    Ok(())
}

/// The ambient tenant of the running task, if any.
#[must_use]
pub fn current() -> Option<TenantId> {
    RequestContext::current().and_then(|ctx| ctx.tenant())
}

/// Run `body` under a scoped tenant override. Establishes a nested request
/// context, so the body also gets a fresh scheduler and cache.
pub async fn run_with_tenant<F>(tenant: impl Into<TenantId>, body: F) -> F::Output
where
    F: Future,
{
    RequestContext::run_with(ContextOptions::with_tenant(tenant), body).await
}

/// Resolve the tenant segment for physical keys: the `no-tenant` literal
/// when tenancy is disabled, else the ambient tenant, else the first
/// resolver that produces one.
pub(crate) fn resolve_tenant(
    config: &Config,
    resolvers: &[Arc<dyn TenantResolver>],
    operation: &'static str,
) -> Result<String, Error> {
    if !config.tenancy.enabled {
        return Ok(key::NO_TENANT.to_string());
    }

    if let Some(tenant) = current() {
        return Ok(tenant.to_string());
    }

    for resolver in resolvers {
        if let Some(tenant) = resolver.resolve() {
            return Ok(tenant.to_string());
        }
    }

    Err(Error::Context { operation })
}
