//! Bootstrap wiring configuration into a running dispatch core: sentinel
//! listeners feed the topology, the topology backs the upstream template,
//! and the dispatcher serves client batches from it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::auth::{AuthCommandProcessor, BackendAuth};
use crate::backend::connector::{RedisConnector, UpstreamRequest};
use crate::backend::pool::ConnectionPool;
use crate::cluster::{ClusterModeProcessor, SlotClusterMode};
use crate::config::ProxyConfig;
use crate::dispatch::{CommandDispatcher, CommandInvokeConfig};
use crate::limit::ConnectLimiter;
use crate::metrics;
use crate::plugin::PluginRegistry;
use crate::sentinel::{
    ListenerHandle, ListenerTiming, MasterListener, SentinelConnector, SlavesListener,
    TcpSentinelConnector,
};
use crate::session::{ChannelInfo, Transport};
use crate::upstream::{SentinelTopology, SentinelUpstreamTemplate, SingleTemplateFactory};

pub struct ProxyCore {
    config: ProxyConfig,
    topology: Arc<SentinelTopology>,
    dispatcher: Arc<CommandDispatcher>,
    listeners: Vec<ListenerHandle>,
}

impl ProxyCore {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = ProxyConfig::load(path).await?;
        Self::start(config)
    }

    /// Starts the listeners against real sentinels. Must be called from
    /// within a tokio runtime.
    pub fn start(config: ProxyConfig) -> Result<Self> {
        let sentinel_auth = config.upstream.sentinel_auth.clone().map(BackendAuth::from);
        let connector = Arc::new(TcpSentinelConnector::new(
            config.upstream.timeout(),
            sentinel_auth,
        ));
        let timing = ListenerTiming {
            query_timeout: config.upstream.timeout().max(ListenerTiming::default().query_timeout),
            ..ListenerTiming::default()
        };
        Self::start_with(config, connector, timing)
    }

    pub fn start_with(
        config: ProxyConfig,
        connector: Arc<dyn SentinelConnector>,
        timing: ListenerTiming,
    ) -> Result<Self> {
        config.ensure_valid()?;
        metrics::register_version(env!("CARGO_PKG_VERSION"));

        let upstream = &config.upstream;
        let topology = Arc::new(SentinelTopology::new(upstream.master_name.clone()));
        let mut listeners = Vec::with_capacity(upstream.sentinels.len() * 2);
        for sentinel in upstream.sentinel_addrs()? {
            listeners.push(
                MasterListener::new(
                    sentinel.clone(),
                    upstream.master_name.clone(),
                    connector.clone(),
                    topology.clone(),
                )
                .with_timing(timing)
                .start(),
            );
            listeners.push(
                SlavesListener::new(
                    sentinel,
                    upstream.master_name.clone(),
                    connector.clone(),
                    topology.clone(),
                )
                .with_timing(timing)
                .start(),
            );
        }

        let backend_auth = upstream.backend_auth.clone().map(BackendAuth::from);
        let pool: Arc<ConnectionPool<UpstreamRequest>> = Arc::new(ConnectionPool::with_slots(
            Arc::new(RedisConnector::new(upstream.timeout(), backend_auth)),
            upstream.sessions_per_node,
        ));
        let template =
            SentinelUpstreamTemplate::new(topology.clone(), pool, upstream.read_from_slave)
                .with_multi_db(upstream.multi_db);
        let factory = Arc::new(SingleTemplateFactory::new(Arc::new(template)));

        let cluster = match &config.cluster_mode {
            Some(cluster) => {
                let mode = SlotClusterMode::from_config(cluster).context("invalid cluster_mode")?;
                Some(Arc::new(mode) as Arc<dyn ClusterModeProcessor>)
            }
            None => None,
        };
        let invoke = CommandInvokeConfig {
            auth: AuthCommandProcessor::from_config(config.auth.clone())?,
            cluster,
            plugins: Arc::new(PluginRegistry::default()),
            connect_limiter: ConnectLimiter::new(&config.connect_limit),
        };
        let dispatcher = Arc::new(CommandDispatcher::new(factory, invoke));

        info!(
            master = %upstream.master_name,
            sentinels = upstream.sentinels.len(),
            cluster_mode = config.cluster_mode.is_some(),
            "proxy core started"
        );
        Ok(Self {
            config,
            topology,
            dispatcher,
            listeners,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<SentinelTopology> {
        &self.topology
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        self.dispatcher.plugins()
    }

    /// Session state for a newly accepted client connection.
    pub fn new_channel(&self, transport: Arc<dyn Transport>) -> ChannelInfo {
        ChannelInfo::new(transport, self.config.task_queue_capacity)
    }

    pub fn running_listeners(&self) -> usize {
        self.listeners
            .iter()
            .filter(|listener| listener.is_running())
            .count()
    }

    /// Stops every sentinel listener and waits for them to exit.
    pub async fn shutdown(self) {
        for listener in self.listeners {
            listener.shutdown().await;
        }
        info!(master = %self.config.upstream.master_name, "proxy core stopped");
    }
}
