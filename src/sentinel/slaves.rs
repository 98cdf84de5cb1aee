use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{
    parse_slaves, pause, ListenerHandle, ListenerTiming, SentinelConnection, SentinelConnector,
    SlavesUpdateCallback,
};
use crate::metrics;
use crate::protocol::redis::Command;
use crate::upstream::HostAndPort;

/// Polls `SENTINEL slaves` for one monitored name.
pub struct SlavesListener {
    sentinel: HostAndPort,
    master_name: String,
    connector: Arc<dyn SentinelConnector>,
    callback: Arc<dyn SlavesUpdateCallback>,
    timing: ListenerTiming,
}

impl SlavesListener {
    pub fn new(
        sentinel: HostAndPort,
        master_name: impl Into<String>,
        connector: Arc<dyn SentinelConnector>,
        callback: Arc<dyn SlavesUpdateCallback>,
    ) -> Self {
        Self {
            sentinel,
            master_name: master_name.into(),
            connector,
            callback,
            timing: ListenerTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: ListenerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn start(self) -> ListenerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(running.clone(), shutdown_rx));
        ListenerHandle::new(running, shutdown_tx, join)
    }

    async fn run(self, running: Arc<AtomicBool>, mut shutdown: watch::Receiver<bool>) {
        info!(
            sentinel = %self.sentinel,
            master = %self.master_name,
            "sentinel slaves listener started"
        );
        let mut connection: Option<Arc<dyn SentinelConnection>> = None;
        while running.load(Ordering::Acquire) {
            let conn = match connection.take() {
                Some(conn) if conn.is_valid() => conn,
                stale => {
                    if let Some(stale) = stale {
                        stale.close();
                    }
                    match self.connector.connect(&self.sentinel).await {
                        Ok(conn) => conn,
                        Err(err) => {
                            metrics::error_incr("sentinel_connect");
                            error!(
                                sentinel = %self.sentinel,
                                error = %err,
                                retry_ms = self.timing.slaves_retry.as_millis() as u64,
                                "connect to sentinel failed"
                            );
                            if pause(self.timing.slaves_retry, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };
            connection = Some(conn.clone());

            self.poll_once(conn.as_ref()).await;
            if pause(self.timing.slaves_poll, &mut shutdown).await {
                break;
            }
        }
        if let Some(conn) = connection {
            conn.close();
        }
        running.store(false, Ordering::Release);
        info!(
            sentinel = %self.sentinel,
            master = %self.master_name,
            "sentinel slaves listener stopped"
        );
    }

    /// One query. Failures are logged and leave the connection in place.
    async fn poll_once(&self, conn: &dyn SentinelConnection) {
        let query = Command::from_parts(["SENTINEL", "slaves", self.master_name.as_str()]);
        match timeout(self.timing.query_timeout, conn.send_command(query)).await {
            Ok(Ok(reply)) => match parse_slaves(&reply) {
                Some(slaves) => {
                    debug!(
                        sentinel = %self.sentinel,
                        master = %self.master_name,
                        count = slaves.len(),
                        "sentinel reported slaves"
                    );
                    self.callback.slaves_update(slaves);
                }
                None => {
                    metrics::error_incr("sentinel_slaves");
                    warn!(
                        sentinel = %self.sentinel,
                        master = %self.master_name,
                        reply = ?reply,
                        "can not get slaves addr"
                    );
                }
            },
            Ok(Err(_)) => {
                metrics::error_incr("sentinel_slaves");
                warn!(
                    sentinel = %self.sentinel,
                    master = %self.master_name,
                    "sentinel connection closed during slaves query"
                );
            }
            Err(_) => {
                metrics::error_incr("sentinel_slaves");
                warn!(
                    sentinel = %self.sentinel,
                    master = %self.master_name,
                    timeout_ms = self.timing.query_timeout.as_millis() as u64,
                    "timed out querying slaves"
                );
            }
        }
    }
}
