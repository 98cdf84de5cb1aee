use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{
    parse_master_addr, parse_switch_master, pause, ListenerHandle, ListenerTiming,
    MasterUpdateCallback, ReplyCell, SentinelConnection, SentinelConnector,
    MASTER_SWITCH_CHANNEL, SWITCH_WINDOW,
};
use crate::metrics;
use crate::protocol::redis::{Command, RespValue};
use crate::upstream::HostAndPort;

/// Follows the master of one monitored name: queries its address, then
/// subscribes to `+switch-master` and reports every failover.
pub struct MasterListener {
    sentinel: HostAndPort,
    master_name: String,
    connector: Arc<dyn SentinelConnector>,
    callback: Arc<dyn MasterUpdateCallback>,
    timing: ListenerTiming,
}

impl MasterListener {
    pub fn new(
        sentinel: HostAndPort,
        master_name: impl Into<String>,
        connector: Arc<dyn SentinelConnector>,
        callback: Arc<dyn MasterUpdateCallback>,
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
            "sentinel master listener started"
        );
        let mut connection: Option<Arc<dyn SentinelConnection>> = None;
        while running.load(Ordering::Acquire) {
            let conn = match connection.take() {
                Some(conn) if conn.is_valid() => {
                    connection = Some(conn.clone());
                    conn
                }
                stale => {
                    if let Some(stale) = stale {
                        stale.close();
                    }
                    match self.connector.connect(&self.sentinel).await {
                        Ok(conn) => {
                            connection = Some(conn.clone());
                            conn
                        }
                        Err(err) => {
                            metrics::error_incr("sentinel_connect");
                            error!(
                                sentinel = %self.sentinel,
                                error = %err,
                                retry_ms = self.timing.master_retry.as_millis() as u64,
                                "connect to sentinel failed"
                            );
                            if pause(self.timing.master_retry, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            match self.watch(conn.as_ref(), &mut shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    metrics::error_incr("sentinel_master");
                    error!(
                        sentinel = %self.sentinel,
                        master = %self.master_name,
                        error = %err,
                        retry_ms = self.timing.master_retry.as_millis() as u64,
                        "lost connection to sentinel"
                    );
                    conn.close();
                    connection = None;
                    if pause(self.timing.master_retry, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        if let Some(conn) = connection {
            conn.close();
        }
        running.store(false, Ordering::Release);
        info!(
            sentinel = %self.sentinel,
            master = %self.master_name,
            "sentinel master listener stopped"
        );
    }

    /// Runs one connected session. `Ok` means shutdown was requested.
    async fn watch(
        &self,
        conn: &dyn SentinelConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let query = Command::from_parts([
            "SENTINEL",
            "get-master-addr-by-name",
            self.master_name.as_str(),
        ]);
        let reply = timeout(self.timing.query_timeout, conn.send_command(query))
            .await
            .context("timed out querying master address")?
            .context("sentinel connection closed during master query")?;
        match parse_master_addr(&reply) {
            Some(master) => {
                debug!(sentinel = %self.sentinel, master = %master, "sentinel reported master");
                self.callback.master_update(master);
            }
            None => debug!(
                sentinel = %self.sentinel,
                master_name = %self.master_name,
                reply = ?reply,
                "sentinel reported no master"
            ),
        }

        let mut current: ReplyCell =
            conn.send_command(Command::from_parts(["SUBSCRIBE", MASTER_SWITCH_CHANNEL]));
        let mut window: VecDeque<ReplyCell> = conn.expect_replies(SWITCH_WINDOW).into();
        let mut idle = interval_at(
            Instant::now() + self.timing.master_idle_check,
            self.timing.master_idle_check,
        );
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                pushed = &mut current => {
                    let Ok(frame) = pushed else {
                        bail!("sentinel subscription closed");
                    };
                    self.on_push(&frame);
                    if window.len() < SWITCH_WINDOW / 2 {
                        window.extend(conn.expect_replies(SWITCH_WINDOW));
                    }
                    current = match window.pop_front() {
                        Some(next) => next,
                        None => bail!("switch window exhausted"),
                    };
                }
                _ = idle.tick() => {
                    if !conn.is_valid() {
                        bail!("sentinel connection is no longer valid");
                    }
                }
            }
        }
    }

    fn on_push(&self, frame: &RespValue) {
        if let Some(master) = parse_switch_master(frame, &self.master_name) {
            info!(
                sentinel = %self.sentinel,
                master_name = %self.master_name,
                master = %master,
                "sentinel announced master switch"
            );
            self.callback.master_update(master);
        }
    }
}
