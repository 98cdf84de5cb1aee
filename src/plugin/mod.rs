//! Request and reply interceptors.
//!
//! Request plugins run in order for every command before any routing rule;
//! the first one returning a reply short-circuits the command. Reply
//! plugins observe every completed reply and cannot alter it. The whole
//! chain is swapped as one unit so a dispatch batch always sees a single
//! consistent snapshot.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use tracing::warn;

use crate::metrics;
use crate::protocol::redis::{Command, RedisCommand, RespValue};
use crate::upstream::{Tenant, UpstreamClientTemplateFactory};

/// View of one command handed to request plugins.
pub struct ProxyRequest<'a> {
    pub db: i64,
    pub command: &'a Command,
    pub tenant: Option<&'a Tenant>,
    pub factory: &'a dyn UpstreamClientTemplateFactory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPluginResponse {
    Pass,
    Reply(RespValue),
}

pub trait ProxyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn execute_request(&self, request: &ProxyRequest<'_>) -> Result<ProxyPluginResponse>;
}

/// One completed reply as seen by reply plugins.
#[derive(Debug)]
pub struct ProxyReply<'a> {
    pub command: Option<RedisCommand>,
    pub reply: &'a RespValue,
    pub from_plugin: bool,
}

pub trait ReplyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn execute_reply(&self, reply: &ProxyReply<'_>) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct PluginChain {
    request_plugins: Vec<Arc<dyn ProxyPlugin>>,
    reply_plugins: Vec<Arc<dyn ReplyPlugin>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_plugin(mut self, plugin: Arc<dyn ProxyPlugin>) -> Self {
        self.request_plugins.push(plugin);
        self
    }

    pub fn with_reply_plugin(mut self, plugin: Arc<dyn ReplyPlugin>) -> Self {
        self.reply_plugins.push(plugin);
        self
    }

    pub fn has_request_plugins(&self) -> bool {
        !self.request_plugins.is_empty()
    }

    /// Runs request plugins in order and returns the first terminal reply.
    /// A failing plugin is logged and treated as a pass.
    pub fn execute_request(&self, request: &ProxyRequest<'_>) -> Option<RespValue> {
        for plugin in &self.request_plugins {
            match plugin.execute_request(request) {
                Ok(ProxyPluginResponse::Pass) => {}
                Ok(ProxyPluginResponse::Reply(reply)) => return Some(reply),
                Err(err) => {
                    metrics::error_incr("plugin");
                    warn!(
                        plugin = plugin.name(),
                        command = %request.command.name_lossy(),
                        error = %err,
                        "request plugin failed, passing command through"
                    );
                }
            }
        }
        None
    }

    pub fn execute_reply(&self, reply: &ProxyReply<'_>) {
        for plugin in &self.reply_plugins {
            if let Err(err) = plugin.execute_reply(reply) {
                metrics::error_incr("plugin");
                warn!(plugin = plugin.name(), error = %err, "reply plugin failed");
            }
        }
    }
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChain")
            .field(
                "request",
                &self.request_plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "reply",
                &self.reply_plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Holder of the active chain; `update` replaces it atomically.
pub struct PluginRegistry {
    current: ArcSwap<PluginChain>,
}

impl PluginRegistry {
    pub fn new(chain: PluginChain) -> Self {
        Self {
            current: ArcSwap::from_pointee(chain),
        }
    }

    pub fn load(&self) -> Arc<PluginChain> {
        self.current.load_full()
    }

    pub fn update(&self, chain: PluginChain) {
        self.current.store(Arc::new(chain));
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(PluginChain::default())
    }
}
