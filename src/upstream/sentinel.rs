use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use futures::future::{ready, FutureExt};
use rand::{seq::SliceRandom, thread_rng};
use tracing::{info, warn};

use super::{HostAndPort, ReplyFuture, UpstreamClientTemplate};
use crate::backend::client::ClientId;
use crate::backend::connector::UpstreamRequest;
use crate::backend::pool::ConnectionPool;
use crate::metrics;
use crate::protocol::redis::{reply, Command, CommandKind, RespValue};
use crate::sentinel::{MasterUpdateCallback, SlavesUpdateCallback};

/// Master and replicas of one monitored name at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub master: Option<HostAndPort>,
    pub replicas: Vec<HostAndPort>,
}

impl TopologySnapshot {
    pub fn nodes(&self) -> Vec<HostAndPort> {
        self.master
            .iter()
            .chain(self.replicas.iter())
            .cloned()
            .collect()
    }
}

/// Topology fed by any number of sentinel listeners. Every update replaces
/// the snapshot as a whole; identical updates from redundant sentinels are
/// dropped.
#[derive(Debug)]
pub struct SentinelTopology {
    master_name: String,
    current: ArcSwap<TopologySnapshot>,
}

impl SentinelTopology {
    pub fn new(master_name: impl Into<String>) -> Self {
        Self {
            master_name: master_name.into(),
            current: ArcSwap::from_pointee(TopologySnapshot::default()),
        }
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    pub fn master(&self) -> Option<HostAndPort> {
        self.current.load().master.clone()
    }

    /// Returns whether the master actually changed.
    pub fn update_master(&self, master: HostAndPort) -> bool {
        let previous = self.current.rcu(|snapshot| {
            if snapshot.master.as_ref() == Some(&master) {
                return snapshot.clone();
            }
            Arc::new(TopologySnapshot {
                master: Some(master.clone()),
                replicas: snapshot.replicas.clone(),
            })
        });
        if previous.master.as_ref() == Some(&master) {
            return false;
        }
        metrics::sentinel_update_incr("master");
        match &previous.master {
            Some(old) => info!(
                master_name = %self.master_name,
                from = %old,
                to = %master,
                "upstream master switched"
            ),
            None => info!(master_name = %self.master_name, master = %master, "upstream master resolved"),
        }
        true
    }

    /// Returns whether the replica set actually changed. Order of the input
    /// does not matter.
    pub fn update_replicas(&self, mut replicas: Vec<HostAndPort>) -> bool {
        replicas.sort();
        replicas.dedup();
        let previous = self.current.rcu(|snapshot| {
            if snapshot.replicas == replicas {
                return snapshot.clone();
            }
            Arc::new(TopologySnapshot {
                master: snapshot.master.clone(),
                replicas: replicas.clone(),
            })
        });
        if previous.replicas == replicas {
            return false;
        }
        metrics::sentinel_update_incr("replicas");
        info!(
            master_name = %self.master_name,
            count = replicas.len(),
            "upstream replicas updated"
        );
        true
    }
}

impl MasterUpdateCallback for SentinelTopology {
    fn master_update(&self, master: HostAndPort) {
        self.update_master(master);
    }
}

impl SlavesUpdateCallback for SentinelTopology {
    fn slaves_update(&self, slaves: Vec<HostAndPort>) {
        self.update_replicas(slaves);
    }
}

/// Template executing commands on the current sentinel master, or on a
/// random replica for reads when enabled.
pub struct SentinelUpstreamTemplate {
    topology: Arc<SentinelTopology>,
    pool: Arc<ConnectionPool<UpstreamRequest>>,
    read_from_slave: bool,
    multi_db: bool,
    fallback_client: ClientId,
    pruned: ArcSwap<TopologySnapshot>,
}

impl SentinelUpstreamTemplate {
    pub fn new(
        topology: Arc<SentinelTopology>,
        pool: Arc<ConnectionPool<UpstreamRequest>>,
        read_from_slave: bool,
    ) -> Self {
        let pruned = ArcSwap::new(topology.snapshot());
        Self {
            topology,
            pool,
            read_from_slave,
            multi_db: true,
            fallback_client: ClientId::new(),
            pruned,
        }
    }

    pub fn with_multi_db(mut self, multi_db: bool) -> Self {
        self.multi_db = multi_db;
        self
    }

    pub fn topology(&self) -> &Arc<SentinelTopology> {
        &self.topology
    }

    fn target(&self, snapshot: &TopologySnapshot, command: &Command) -> Option<HostAndPort> {
        let is_read = command
            .redis_command()
            .map(|cmd| cmd.kind() == CommandKind::Read)
            .unwrap_or(false);
        if self.read_from_slave && is_read {
            if let Some(replica) = snapshot.replicas.choose(&mut thread_rng()) {
                return Some(replica.clone());
            }
        }
        snapshot.master.clone()
    }

    /// Stops sessions to nodes that left the topology since the last call.
    fn prune_sessions(&self, snapshot: &Arc<TopologySnapshot>) {
        if Arc::ptr_eq(&self.pruned.load(), snapshot) {
            return;
        }
        self.pruned.store(snapshot.clone());
        self.pool.retain_nodes(&snapshot.nodes());
    }
}

impl UpstreamClientTemplate for SentinelUpstreamTemplate {
    fn send_command(&self, db: i64, commands: Vec<Command>) -> Result<Vec<ReplyFuture>> {
        let snapshot = self.topology.snapshot();
        if snapshot.master.is_none() {
            bail!("no master known for '{}'", self.topology.master_name());
        }
        self.prune_sessions(&snapshot);

        let mut replies: Vec<ReplyFuture> = Vec::with_capacity(commands.len());
        for command in commands {
            if command
                .redis_command()
                .map(|cmd| cmd.is_pubsub())
                .unwrap_or(false)
            {
                replies.push(
                    ready(RespValue::error(
                        "ERR pub/sub is not supported by the sentinel upstream",
                    ))
                    .boxed(),
                );
                continue;
            }
            let Some(node) = self.target(&snapshot, &command) else {
                replies.push(ready(reply::upstream_not_available()).boxed());
                continue;
            };
            let client = command.client_id().unwrap_or(self.fallback_client);
            match self.pool.dispatch(&node, client, UpstreamRequest::new(db, command)) {
                Ok(response) => replies.push(
                    async move {
                        match response.await {
                            Ok(Ok(value)) => value,
                            Ok(Err(err)) => {
                                warn!(upstream = %node, error = %err, "upstream command failed");
                                reply::upstream_not_available()
                            }
                            Err(_) => reply::upstream_not_available(),
                        }
                    }
                    .boxed(),
                ),
                Err(err) => {
                    metrics::error_incr("upstream_dispatch");
                    warn!(upstream = %node, error = %err, "failed to enqueue upstream command");
                    replies.push(ready(reply::upstream_not_available()).boxed());
                }
            }
        }
        Ok(replies)
    }

    fn is_multi_db_support(&self) -> bool {
        self.multi_db
    }

    fn is_pubsub_support(&self) -> bool {
        false
    }
}
