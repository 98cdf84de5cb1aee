//! Sentinel watchers keeping the current master and replica set fresh.
//!
//! Each listener watches exactly one master name through one sentinel
//! endpoint. Deployments with several sentinels run one pair per endpoint,
//! all feeding the same callback; de-duplication is the consumer's job.

mod connection;
mod master;
mod slaves;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

use crate::protocol::redis::RespValue;
use crate::upstream::HostAndPort;

pub use connection::{
    ReplyCell, SentinelConnection, SentinelConnector, TcpSentinelConnection, TcpSentinelConnector,
};
pub use master::MasterListener;
pub use slaves::SlavesListener;

pub const MASTER_SWITCH_CHANNEL: &str = "+switch-master";

/// Number of placeholder cells pipelined for pushed switch messages.
pub const SWITCH_WINDOW: usize = 32;

/// Receives the newest master address. Must return quickly.
pub trait MasterUpdateCallback: Send + Sync {
    fn master_update(&self, master: HostAndPort);
}

impl<F> MasterUpdateCallback for F
where
    F: Fn(HostAndPort) + Send + Sync,
{
    fn master_update(&self, master: HostAndPort) {
        self(master)
    }
}

/// Receives the full healthy replica list on every successful poll.
pub trait SlavesUpdateCallback: Send + Sync {
    fn slaves_update(&self, slaves: Vec<HostAndPort>);
}

impl<F> SlavesUpdateCallback for F
where
    F: Fn(Vec<HostAndPort>) + Send + Sync,
{
    fn slaves_update(&self, slaves: Vec<HostAndPort>) {
        self(slaves)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerTiming {
    pub master_retry: Duration,
    pub slaves_retry: Duration,
    pub query_timeout: Duration,
    pub master_idle_check: Duration,
    pub slaves_poll: Duration,
}

impl Default for ListenerTiming {
    fn default() -> Self {
        Self {
            master_retry: Duration::from_secs(5),
            slaves_retry: Duration::from_secs(3),
            query_timeout: Duration::from_secs(10),
            master_idle_check: Duration::from_secs(10),
            slaves_poll: Duration::from_secs(5),
        }
    }
}

/// Handle of a running listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(
        running: Arc<AtomicBool>,
        shutdown: watch::Sender<bool>,
        join: JoinHandle<()>,
    ) -> Self {
        Self {
            running,
            shutdown,
            join,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the listener and waits for it to close its connection and
    /// exit. A query already in flight is allowed to finish.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            if !err.is_cancelled() {
                warn!(error = %err, "sentinel listener task panicked");
            }
        }
    }
}

/// Sleeps for `delay` unless shutdown is signalled first. Returns `true`
/// when the listener should stop.
pub(crate) async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = sleep(delay) => *shutdown.borrow(),
    }
}

fn text(value: &RespValue) -> Option<&str> {
    value
        .as_bytes()
        .and_then(|data| std::str::from_utf8(data).ok())
}

/// Parses the reply of `SENTINEL get-master-addr-by-name`.
pub fn parse_master_addr(reply: &RespValue) -> Option<HostAndPort> {
    let items = reply.as_array()?;
    if items.len() < 2 {
        return None;
    }
    let host = text(&items[0])?;
    let port = text(&items[1])?.parse().ok()?;
    Some(HostAndPort::new(host, port))
}

/// Parses the reply of `SENTINEL slaves`: one flat field/value array per
/// replica. Replicas sentinel reports as down or disconnected are skipped.
pub fn parse_slaves(reply: &RespValue) -> Option<Vec<HostAndPort>> {
    let entries = reply.as_array()?;
    let mut slaves = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(fields) = entry.as_array() else {
            continue;
        };
        let mut ip = None;
        let mut port = None;
        let mut healthy = true;
        for pair in fields.chunks_exact(2) {
            let (Some(field), Some(value)) = (text(&pair[0]), text(&pair[1])) else {
                continue;
            };
            match field {
                "ip" => ip = Some(value),
                "port" => port = value.parse::<u16>().ok(),
                "flags" => {
                    healthy = !value
                        .split(',')
                        .any(|flag| matches!(flag, "s_down" | "o_down" | "disconnected"))
                }
                _ => {}
            }
        }
        if let (Some(ip), Some(port), true) = (ip, port, healthy) {
            slaves.push(HostAndPort::new(ip, port));
        }
    }
    Some(slaves)
}

/// Parses one pushed `+switch-master` message for `master_name`. The
/// payload reads `name old-host old-port new-host new-port`.
pub fn parse_switch_master(reply: &RespValue, master_name: &str) -> Option<HostAndPort> {
    let items = reply.as_array()?;
    if items.len() != 3 {
        return None;
    }
    if !text(&items[0])?.eq_ignore_ascii_case("message") {
        return None;
    }
    let tokens: Vec<&str> = text(&items[2])?.split(' ').collect();
    if tokens.len() < 5 || tokens[0] != master_name {
        return None;
    }
    let port = tokens[4].parse().ok()?;
    Some(HostAndPort::new(tokens[3], port))
}
