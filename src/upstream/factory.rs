use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{ready, FutureExt, Shared};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::{Tenant, TemplateFuture, UpstreamClientTemplate, UpstreamClientTemplateFactory};

/// Factory serving every connection from one template.
#[derive(Clone)]
pub struct SingleTemplateFactory {
    template: Arc<dyn UpstreamClientTemplate>,
}

impl SingleTemplateFactory {
    pub fn new(template: Arc<dyn UpstreamClientTemplate>) -> Self {
        Self { template }
    }
}

impl UpstreamClientTemplateFactory for SingleTemplateFactory {
    fn try_get(&self, _tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>> {
        Some(self.template.clone())
    }

    fn get_or_initialize(&self, _tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>> {
        Some(self.template.clone())
    }

    fn get_or_initialize_async(&self, _tenant: &Tenant) -> Option<TemplateFuture> {
        Some(ready(Some(self.template.clone())).boxed())
    }

    fn is_multi_tenants_support(&self) -> bool {
        false
    }
}

/// Builds the template of a tenant on first use. `Ok(None)` means the
/// tenant has no upstream configured.
#[async_trait]
pub trait TenantTemplateBuilder: Send + Sync + 'static {
    async fn build(&self, tenant: &Tenant) -> Result<Option<Arc<dyn UpstreamClientTemplate>>>;
}

type PendingInit = Shared<TemplateFuture>;

/// Multi-tenant factory caching one template per tenant. Connections
/// without a routable tenant use the default template, if any.
pub struct TenantTemplateFactory {
    default: Option<Arc<dyn UpstreamClientTemplate>>,
    builder: Arc<dyn TenantTemplateBuilder>,
    cache: Arc<RwLock<HashMap<Tenant, Arc<dyn UpstreamClientTemplate>>>>,
    pending: Arc<Mutex<HashMap<Tenant, PendingInit>>>,
}

impl TenantTemplateFactory {
    pub fn new(
        default: Option<Arc<dyn UpstreamClientTemplate>>,
        builder: Arc<dyn TenantTemplateBuilder>,
    ) -> Self {
        Self {
            default,
            builder,
            cache: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cached_tenants(&self) -> usize {
        self.cache.read().len()
    }

    /// Forgets the template of `tenant`; the next request rebuilds it.
    pub fn invalidate(&self, tenant: &Tenant) -> bool {
        self.cache.write().remove(tenant).is_some()
    }

    fn lookup(&self, tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>> {
        match tenant.filter(|tenant| tenant.is_routable()) {
            Some(tenant) => self.cache.read().get(tenant).cloned(),
            None => self.default.clone(),
        }
    }
}

impl UpstreamClientTemplateFactory for TenantTemplateFactory {
    fn try_get(&self, tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>> {
        self.lookup(tenant)
    }

    fn get_or_initialize(&self, tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>> {
        self.lookup(tenant)
    }

    fn get_or_initialize_async(&self, tenant: &Tenant) -> Option<TemplateFuture> {
        if !tenant.is_routable() {
            return None;
        }
        if let Some(template) = self.cache.read().get(tenant).cloned() {
            return Some(ready(Some(template)).boxed());
        }

        let mut pending = self.pending.lock();
        if let Some(init) = pending.get(tenant) {
            return Some(init.clone().boxed());
        }
        let builder = self.builder.clone();
        let cache = self.cache.clone();
        let pending_map = self.pending.clone();
        let key = tenant.clone();
        let init: TemplateFuture = async move {
            let template = match builder.build(&key).await {
                Ok(Some(template)) => {
                    info!(tenant = %key, "upstream template initialized");
                    cache.write().insert(key.clone(), template.clone());
                    Some(template)
                }
                Ok(None) => {
                    warn!(tenant = %key, "no upstream configured for tenant");
                    None
                }
                Err(err) => {
                    warn!(tenant = %key, error = %err, "failed to initialize upstream template");
                    None
                }
            };
            pending_map.lock().remove(&key);
            template
        }
        .boxed();
        let init = init.shared();
        pending.insert(tenant.clone(), init.clone());
        Some(init.boxed())
    }

    fn is_multi_tenants_support(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::redis::Command;
    use crate::upstream::ReplyFuture;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop(i64);

    impl UpstreamClientTemplate for Noop {
        fn send_command(&self, _db: i64, _commands: Vec<Command>) -> Result<Vec<ReplyFuture>> {
            Ok(Vec::new())
        }

        fn is_multi_db_support(&self) -> bool {
            self.0 > 0
        }
    }

    struct Builder {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl TenantTemplateBuilder for Builder {
        async fn build(&self, tenant: &Tenant) -> Result<Option<Arc<dyn UpstreamClientTemplate>>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            match tenant.bgroup.as_str() {
                "missing" => Ok(None),
                "broken" => bail!("bad upstream url"),
                _ => Ok(Some(Arc::new(Noop(tenant.bid)))),
            }
        }
    }

    fn factory() -> (Arc<Builder>, TenantTemplateFactory) {
        let builder = Arc::new(Builder {
            builds: AtomicUsize::new(0),
        });
        let factory = TenantTemplateFactory::new(Some(Arc::new(Noop(0))), builder.clone());
        (builder, factory)
    }

    #[tokio::test]
    async fn concurrent_initialisation_builds_once() {
        let (builder, factory) = factory();
        let tenant = Tenant::new(7, "default");
        assert!(factory.try_get(Some(&tenant)).is_none());

        let first = factory.get_or_initialize_async(&tenant).unwrap();
        let second = factory.get_or_initialize_async(&tenant).unwrap();
        let (a, b) = futures::join!(first, second);
        assert!(a.unwrap().is_multi_db_support());
        assert!(b.is_some());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert!(factory.try_get(Some(&tenant)).is_some());
        assert_eq!(factory.cached_tenants(), 1);
    }

    #[tokio::test]
    async fn unknown_or_failing_tenants_resolve_to_none() {
        let (_, factory) = factory();
        let missing = factory
            .get_or_initialize_async(&Tenant::new(1, "missing"))
            .unwrap();
        assert!(missing.await.is_none());
        let broken = factory
            .get_or_initialize_async(&Tenant::new(1, "broken"))
            .unwrap();
        assert!(broken.await.is_none());
        assert!(factory.get_or_initialize_async(&Tenant::new(0, "g")).is_none());
        assert_eq!(factory.cached_tenants(), 0);
    }

    #[test]
    fn tenantless_connections_use_default() {
        let (_, factory) = factory();
        let default = factory.get_or_initialize(None).unwrap();
        assert!(!default.is_multi_db_support());
        assert!(factory.try_get(Some(&Tenant::new(-1, "g"))).is_some());
        assert!(factory.is_multi_tenants_support());
    }
}
