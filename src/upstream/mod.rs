//! Upstream collaborator contracts and their sentinel-backed implementations.

mod factory;
mod sentinel;

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::protocol::redis::{Command, RespValue};

pub use factory::{SingleTemplateFactory, TenantTemplateBuilder, TenantTemplateFactory};
pub use sentinel::{SentinelTopology, SentinelUpstreamTemplate, TopologySnapshot};

/// Business id plus business group selecting an isolated upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Tenant {
    pub bid: i64,
    pub bgroup: String,
}

impl Tenant {
    pub fn new(bid: i64, bgroup: impl Into<String>) -> Self {
        Self {
            bid,
            bgroup: bgroup.into(),
        }
    }

    /// Only positive bids with a group name route to a dedicated upstream.
    pub fn is_routable(&self) -> bool {
        self.bid > 0 && !self.bgroup.is_empty()
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.bid, self.bgroup)
    }
}

/// Resolved upstream endpoint. Replaced wholesale on topology change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`; the port is taken after the last colon.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("address '{}' must be host:port", addr))?;
        if host.is_empty() {
            return Err(anyhow!("address '{}' has an empty host", addr));
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in address '{}'", addr))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Eventual reply of one forwarded command. Upstream failures resolve to an
/// error reply rather than failing the future.
pub type ReplyFuture = BoxFuture<'static, RespValue>;

/// Executes batches of commands against one upstream deployment.
pub trait UpstreamClientTemplate: Send + Sync {
    /// Forwards `commands` against database `db`. The returned futures are
    /// positionally aligned with `commands`.
    fn send_command(&self, db: i64, commands: Vec<Command>) -> Result<Vec<ReplyFuture>>;

    fn is_multi_db_support(&self) -> bool;

    /// Whether (P)SUBSCRIBE and friends can be served. A connection only
    /// enters subscribe mode through a template that says yes.
    fn is_pubsub_support(&self) -> bool {
        true
    }
}

pub type TemplateFuture = BoxFuture<'static, Option<Arc<dyn UpstreamClientTemplate>>>;

/// Provides the template serving a tenant (or the default upstream when the
/// connection carries no tenant).
pub trait UpstreamClientTemplateFactory: Send + Sync {
    /// Non-blocking best effort lookup of an already initialised template.
    fn try_get(&self, tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>>;

    /// Synchronous path used by single-tenant deployments.
    fn get_or_initialize(&self, tenant: Option<&Tenant>) -> Option<Arc<dyn UpstreamClientTemplate>>;

    /// Asynchronous initialisation. `None` means the tenant can never be
    /// served.
    fn get_or_initialize_async(&self, tenant: &Tenant) -> Option<TemplateFuture>;

    fn is_multi_tenants_support(&self) -> bool;
}
