//! Per-tenant live connection accounting and limits.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::metrics;
use crate::upstream::Tenant;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectLimitConfig {
    /// Threshold applied to tenants without an override. Absent means
    /// unlimited.
    #[serde(default)]
    pub default_threshold: Option<usize>,
    #[serde(default)]
    pub tenants: Vec<TenantLimitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantLimitConfig {
    pub bid: i64,
    pub bgroup: String,
    pub threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitExceeded {
    pub current: usize,
    pub threshold: usize,
}

/// Live connection counts per tenant plus their configured thresholds.
#[derive(Debug, Clone, Default)]
pub struct ConnectLimiter {
    default_threshold: Option<usize>,
    overrides: Arc<HashMap<Tenant, usize>>,
    counts: Arc<Mutex<HashMap<Tenant, usize>>>,
}

impl ConnectLimiter {
    pub fn new(config: &ConnectLimitConfig) -> Self {
        let overrides = config
            .tenants
            .iter()
            .map(|limit| (Tenant::new(limit.bid, limit.bgroup.clone()), limit.threshold))
            .collect();
        Self {
            default_threshold: config.default_threshold,
            overrides: Arc::new(overrides),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn threshold(&self, tenant: &Tenant) -> Option<usize> {
        self.overrides
            .get(tenant)
            .copied()
            .or(self.default_threshold)
    }

    pub fn current(&self, tenant: &Tenant) -> usize {
        self.counts.lock().get(tenant).copied().unwrap_or(0)
    }

    /// Registers one more connection for `tenant` unless the tenant is
    /// already at its threshold. Check and increment happen under one lock.
    pub fn try_register(&self, tenant: &Tenant) -> Result<TenantConnectionGuard, LimitExceeded> {
        let threshold = self.threshold(tenant);
        let mut counts = self.counts.lock();
        let current = counts.get(tenant).copied().unwrap_or(0);
        if let Some(threshold) = threshold {
            if current >= threshold {
                return Err(LimitExceeded { current, threshold });
            }
        }
        counts.insert(tenant.clone(), current + 1);
        metrics::tenant_connections_set(&tenant.to_string(), current + 1);
        Ok(TenantConnectionGuard {
            tenant: tenant.clone(),
            counts: self.counts.clone(),
        })
    }
}

/// Holds one registered connection; dropping it releases the slot.
#[derive(Debug)]
pub struct TenantConnectionGuard {
    tenant: Tenant,
    counts: Arc<Mutex<HashMap<Tenant, usize>>>,
}

impl TenantConnectionGuard {
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }
}

impl Drop for TenantConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        let remaining = match counts.get_mut(&self.tenant) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            counts.remove(&self.tenant);
        }
        metrics::tenant_connections_set(&self.tenant.to_string(), remaining);
    }
}
