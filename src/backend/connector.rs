use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::BackendAuth;
use crate::backend::pool::{BackendRequest, Connector, SessionCommand};
use crate::metrics::{self, Tracker};
use crate::protocol::redis::{Command, RespCodec, RespValue};
use crate::upstream::HostAndPort;

/// One command bound for an upstream node, with the database it must run in.
pub struct UpstreamRequest {
    pub db: i64,
    pub command: Command,
    tracker: Option<Tracker>,
}

impl UpstreamRequest {
    pub fn new(db: i64, command: Command) -> Self {
        Self {
            db,
            command,
            tracker: None,
        }
    }
}

impl BackendRequest for UpstreamRequest {
    type Response = RespValue;

    fn apply_tracker(&mut self, node: &HostAndPort) {
        if self.tracker.is_none() {
            self.tracker = Some(metrics::upstream_tracker(&node.to_string()));
        }
    }
}

struct Session {
    framed: Framed<TcpStream, RespCodec>,
    db: i64,
}

/// Session worker speaking RESP2 to a plain redis node.
pub struct RedisConnector {
    timeout: Duration,
    backend_auth: Option<BackendAuth>,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: usize,
}

impl RedisConnector {
    pub fn new(timeout: Duration, backend_auth: Option<BackendAuth>) -> Self {
        Self {
            timeout,
            backend_auth,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(50),
            max_reconnect_attempts: 3,
        }
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    async fn open_stream(&self, node: &HostAndPort) -> Result<Framed<TcpStream, RespCodec>> {
        let address = node.to_string();
        let stream = timeout(self.timeout, TcpStream::connect(&address))
            .await
            .with_context(|| format!("connection to {} timed out", address))??;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to set TCP_NODELAY for {}", address))?;
        let keepalive = TcpKeepalive::new()
            .with_time(self.heartbeat_interval)
            .with_interval(self.heartbeat_interval);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(upstream = %address, error = %err, "failed to enable upstream TCP keepalive");
        }
        let mut framed = Framed::new(stream, RespCodec);
        if let Some(auth) = &self.backend_auth {
            auth.apply_to_stream(&mut framed, self.timeout, &address)
                .await?;
        }
        Ok(framed)
    }

    async fn connect_with_retry(&self, node: &HostAndPort) -> Result<Session> {
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..self.max_reconnect_attempts {
            match self.open_stream(node).await {
                Ok(framed) => return Ok(Session { framed, db: 0 }),
                Err(err) => {
                    metrics::error_incr("upstream_connect");
                    warn!(
                        upstream = %node,
                        attempt = attempt + 1,
                        error = %err,
                        "failed to connect upstream"
                    );
                    last_error = Some(err);
                    if attempt + 1 < self.max_reconnect_attempts {
                        sleep(self.reconnect_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("unable to connect upstream {}", node)))
    }

    async fn round_trip(
        &self,
        framed: &mut Framed<TcpStream, RespCodec>,
        command: Command,
    ) -> Result<RespValue> {
        timeout(self.timeout, framed.send(command))
            .await
            .context("timed out sending command")??;
        match timeout(self.timeout, framed.next()).await {
            Ok(Some(Ok(value))) => Ok(value),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Err(anyhow!("upstream closed connection")),
            Err(_) => Err(anyhow!("timed out waiting for response")),
        }
    }

    /// Runs `request` on the session, switching database first when the
    /// connection currently sits on another one.
    async fn execute(&self, session: &mut Session, request: UpstreamRequest) -> Result<RespValue> {
        if session.db != request.db {
            let select = Command::from_parts(["SELECT".to_string(), request.db.to_string()]);
            let reply = self.round_trip(&mut session.framed, select).await?;
            if reply.is_error() {
                return Ok(reply);
            }
            session.db = request.db;
        }
        let reply = self.round_trip(&mut session.framed, request.command).await;
        drop(request.tracker);
        reply
    }

    async fn heartbeat(&self, framed: &mut Framed<TcpStream, RespCodec>) -> Result<()> {
        match self.round_trip(framed, Command::from_parts(["PING"])).await? {
            RespValue::SimpleString(ref data) | RespValue::BulkString(ref data)
                if data.eq_ignore_ascii_case(b"PONG") =>
            {
                Ok(())
            }
            other => bail!("unexpected heartbeat reply: {:?}", other),
        }
    }
}

#[async_trait]
impl Connector<UpstreamRequest> for RedisConnector {
    async fn run_session(
        self: Arc<Self>,
        node: HostAndPort,
        mut rx: mpsc::Receiver<SessionCommand<UpstreamRequest>>,
    ) {
        info!(upstream = %node, "starting upstream session");
        let mut session: Option<Session> = None;
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd_opt = rx.recv() => {
                    let Some(cmd) = cmd_opt else {
                        break;
                    };

                    if session.is_none() {
                        match self.connect_with_retry(&node).await {
                            Ok(connected) => session = Some(connected),
                            Err(err) => {
                                let _ = cmd.respond_to.send(Err(err));
                                continue;
                            }
                        }
                    }

                    if let Some(active) = session.as_mut() {
                        let result = self.execute(active, cmd.request).await;
                        if let Err(err) = &result {
                            metrics::error_incr("upstream_execute");
                            warn!(upstream = %node, error = %err, "upstream request failed");
                            session = None;
                        }
                        if cmd.respond_to.send(result).is_err() {
                            debug!(upstream = %node, "upstream reply dropped (client gone)");
                        }
                    }
                }
                _ = heartbeat.tick(), if session.is_some() => {
                    if let Some(active) = session.as_mut() {
                        if let Err(err) = self.heartbeat(&mut active.framed).await {
                            metrics::error_incr("upstream_heartbeat");
                            warn!(upstream = %node, error = %err, "upstream heartbeat failed");
                            session = None;
                        }
                    }
                }
            }
        }

        debug!(upstream = %node, "upstream session terminated");
    }
}
