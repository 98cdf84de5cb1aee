//! Cluster mode: the proxy presents itself as a redis cluster whose nodes
//! are proxy instances, each owning a static range of slots.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures::future::{ready, BoxFuture, FutureExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::keys::find_keys;
use crate::protocol::redis::{hash_slot, reply, Command, RespValue, SlotMap};
use crate::upstream::HostAndPort;

/// Cluster behaviour consulted by the dispatcher.
pub trait ClusterModeProcessor: Send + Sync {
    /// Answers a `CLUSTER <sub>` command.
    fn cluster_commands(&self, command: &Command) -> BoxFuture<'static, RespValue>;

    /// Returns the redirection reply when the keys of `command` belong to
    /// another node, or a cross-slot error when they span several slots.
    fn is_command_move(&self, command: &Command) -> Option<RespValue>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterModeConfig {
    /// Address this proxy advertises, `host:port`.
    pub current_node: String,
    pub nodes: Vec<ClusterNodeConfig>,
    /// Two-byte hash tag delimiters such as `{}`.
    #[serde(default = "default_hash_tag")]
    pub hash_tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterNodeConfig {
    pub addr: String,
    /// Inclusive ranges written as `start-end` or a single slot.
    pub slots: Vec<String>,
}

fn default_hash_tag() -> Option<String> {
    Some("{}".to_string())
}

impl ClusterModeConfig {
    pub fn slot_map(&self) -> Result<SlotMap> {
        let mut map = SlotMap::new();
        for node in &self.nodes {
            HostAndPort::parse(&node.addr)?;
            for range in &node.slots {
                let (start, end) = parse_slot_range(range)
                    .with_context(|| format!("invalid slot range '{}' for {}", range, node.addr))?;
                map.assign(start, end, &node.addr)?;
            }
        }
        Ok(map)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        HostAndPort::parse(&self.current_node)?;
        if let Some(tag) = &self.hash_tag {
            if tag.len() != 2 {
                bail!("hash_tag must be exactly two bytes, got '{}'", tag);
            }
        }
        let map = self.slot_map()?;
        if !map.all_nodes().iter().any(|node| *node == self.current_node) {
            bail!("current node {} owns no slot", self.current_node);
        }
        Ok(())
    }
}

fn parse_slot_range(range: &str) -> Result<(u16, u16)> {
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (range.trim(), range.trim()),
    };
    Ok((start.parse()?, end.parse()?))
}

/// Slot-map backed cluster mode.
pub struct SlotClusterMode {
    current: HostAndPort,
    hash_tag: Option<Bytes>,
    slots: ArcSwap<SlotMap>,
    heartbeats: Mutex<HashMap<String, Instant>>,
}

impl SlotClusterMode {
    pub fn new(current: HostAndPort, slots: SlotMap, hash_tag: Option<Bytes>) -> Self {
        Self {
            current,
            hash_tag,
            slots: ArcSwap::from_pointee(slots),
            heartbeats: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ClusterModeConfig) -> Result<Self> {
        config.ensure_valid()?;
        Ok(Self::new(
            HostAndPort::parse(&config.current_node)?,
            config.slot_map()?,
            config.hash_tag.as_ref().map(|tag| Bytes::from(tag.clone())),
        ))
    }

    pub fn update_slots(&self, slots: SlotMap) {
        self.slots.store(Arc::new(slots));
    }

    /// Proxy nodes that sent a heartbeat, with the time of the last one.
    pub fn heartbeats(&self) -> Vec<(String, Instant)> {
        let mut seen: Vec<_> = self
            .heartbeats
            .lock()
            .iter()
            .map(|(node, at)| (node.clone(), *at))
            .collect();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        seen
    }

    fn node_id(node: &str) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        node.hash(&mut hasher);
        format!("{:0>40x}", hasher.finish())
    }

    fn info(&self) -> RespValue {
        let slots = self.slots.load();
        let assigned = slots.assigned_count();
        let nodes = slots.all_nodes();
        let state = if assigned == crate::protocol::redis::SLOT_COUNT as usize {
            "ok"
        } else {
            "fail"
        };
        let body = format!(
            "cluster_state:{}\r\ncluster_slots_assigned:{}\r\ncluster_slots_ok:{}\r\ncluster_slots_pfail:0\r\ncluster_slots_fail:0\r\ncluster_known_nodes:{}\r\ncluster_size:{}\r\n",
            state,
            assigned,
            assigned,
            nodes.len(),
            nodes.len(),
        );
        RespValue::bulk(body)
    }

    fn proxy_heartbeat(&self, command: &Command) -> RespValue {
        if let Some(source) = command.arg(2) {
            let source = String::from_utf8_lossy(source).into_owned();
            debug!(source = %source, "cluster proxy heartbeat");
            self.heartbeats.lock().insert(source, Instant::now());
        }
        reply::ok()
    }
}

impl ClusterModeProcessor for SlotClusterMode {
    fn cluster_commands(&self, command: &Command) -> BoxFuture<'static, RespValue> {
        let response = match command.arg(1) {
            None => reply::wrong_number_of_args("cluster"),
            Some(sub) if sub.eq_ignore_ascii_case(b"INFO") => self.info(),
            Some(sub) if sub.eq_ignore_ascii_case(b"SLOTS") => self.slots.load().to_slots_reply(),
            Some(sub) if sub.eq_ignore_ascii_case(b"MYID") => {
                RespValue::bulk(Self::node_id(&self.current.to_string()))
            }
            Some(sub) if sub.eq_ignore_ascii_case(b"PROXY_HEARTBEAT") => {
                self.proxy_heartbeat(command)
            }
            Some(sub) => RespValue::error(format!(
                "ERR unknown subcommand '{}'",
                String::from_utf8_lossy(sub)
            )),
        };
        ready(response).boxed()
    }

    fn is_command_move(&self, command: &Command) -> Option<RespValue> {
        let keys = find_keys(command);
        let hash_tag = self.hash_tag.as_deref();
        let mut slots = keys.iter().map(|key| hash_slot(key, hash_tag));
        let slot = slots.next()?;
        if slots.any(|other| other != slot) {
            return Some(RespValue::error(
                "CROSSSLOT Keys in request don't hash to the same slot",
            ));
        }
        let map = self.slots.load();
        let owner = map.owner_of(slot)?;
        if owner == self.current.to_string() {
            return None;
        }
        Some(RespValue::error(format!("MOVED {} {}", slot, owner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> SlotClusterMode {
        let config = ClusterModeConfig {
            current_node: "10.0.0.1:6380".into(),
            nodes: vec![
                ClusterNodeConfig {
                    addr: "10.0.0.1:6380".into(),
                    slots: vec!["0-8191".into()],
                },
                ClusterNodeConfig {
                    addr: "10.0.0.2:6380".into(),
                    slots: vec!["8192-16383".into()],
                },
            ],
            hash_tag: default_hash_tag(),
        };
        SlotClusterMode::from_config(&config).unwrap()
    }

    #[test]
    fn keys_owned_elsewhere_are_moved() {
        let cluster = cluster();
        // slot("foo") = 12182, owned by the second node.
        assert_eq!(
            cluster.is_command_move(&Command::from_parts(["GET", "foo"])),
            Some(RespValue::error("MOVED 12182 10.0.0.2:6380"))
        );
        // slot("bar") = 5061, local.
        assert_eq!(cluster.is_command_move(&Command::from_parts(["GET", "bar"])), None);
        assert_eq!(cluster.is_command_move(&Command::from_parts(["PING"])), None);
    }

    #[test]
    fn multi_key_commands_must_share_a_slot() {
        let cluster = cluster();
        let cross = cluster.is_command_move(&Command::from_parts(["MGET", "foo", "bar"]));
        assert!(matches!(cross, Some(RespValue::Error(ref e)) if e.starts_with(b"CROSSSLOT")));
        let tagged =
            cluster.is_command_move(&Command::from_parts(["MGET", "{bar}.a", "{bar}.b"]));
        assert_eq!(tagged, None);
    }

    #[tokio::test]
    async fn cluster_subcommands() {
        let cluster = cluster();
        let info = cluster
            .cluster_commands(&Command::from_parts(["CLUSTER", "INFO"]))
            .await;
        let RespValue::BulkString(body) = info else {
            panic!("expected bulk info");
        };
        assert!(body.starts_with(b"cluster_state:ok\r\n"));

        let slots = cluster
            .cluster_commands(&Command::from_parts(["cluster", "slots"]))
            .await;
        assert_eq!(slots.as_array().map(|s| s.len()), Some(2));

        let heartbeat = cluster
            .cluster_commands(&Command::from_parts([
                "CLUSTER",
                "PROXY_HEARTBEAT",
                "10.0.0.2:6380",
                "ONLINE",
            ]))
            .await;
        assert_eq!(heartbeat, reply::ok());
        assert_eq!(cluster.heartbeats()[0].0, "10.0.0.2:6380");

        let myid = cluster
            .cluster_commands(&Command::from_parts(["CLUSTER", "MYID"]))
            .await;
        assert_eq!(myid.as_bytes().map(|id| id.len()), Some(40));

        assert!(cluster
            .cluster_commands(&Command::from_parts(["CLUSTER", "RESET"]))
            .await
            .is_error());
    }

    #[test]
    fn config_validation() {
        let mut config = ClusterModeConfig {
            current_node: "10.0.0.9:6380".into(),
            nodes: vec![ClusterNodeConfig {
                addr: "10.0.0.1:6380".into(),
                slots: vec!["0-16383".into()],
            }],
            hash_tag: None,
        };
        assert!(config.ensure_valid().is_err());
        config.current_node = "10.0.0.1:6380".into();
        assert!(config.ensure_valid().is_ok());
        config.nodes[0].slots = vec!["9-x".into()];
        assert!(config.ensure_valid().is_err());
        assert_eq!(parse_slot_range("7").unwrap(), (7, 7));
    }
}
