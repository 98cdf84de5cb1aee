use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::auth::BackendAuth;
use crate::protocol::redis::{Command, RespCodec, RespValue};
use crate::upstream::HostAndPort;

/// Single-assignment reply slot. Resolves with `Err` once the connection
/// is gone without the slot being filled.
pub type ReplyCell = oneshot::Receiver<RespValue>;

/// Opens connections to sentinel nodes.
#[async_trait]
pub trait SentinelConnector: Send + Sync + 'static {
    async fn connect(&self, sentinel: &HostAndPort) -> Result<Arc<dyn SentinelConnection>>;
}

/// A pipelined connection whose incoming frames fill reply cells strictly in
/// registration order.
pub trait SentinelConnection: Send + Sync {
    fn is_valid(&self) -> bool;

    fn send_command(&self, command: Command) -> ReplyCell;

    /// Registers `count` cells filled by frames the server pushes without a
    /// matching request, as happens on a subscribed connection.
    fn expect_replies(&self, count: usize) -> Vec<ReplyCell>;

    fn close(&self);
}

#[derive(Debug, Clone)]
pub struct TcpSentinelConnector {
    timeout: Duration,
    auth: Option<BackendAuth>,
}

impl TcpSentinelConnector {
    pub fn new(timeout: Duration, auth: Option<BackendAuth>) -> Self {
        Self { timeout, auth }
    }
}

#[async_trait]
impl SentinelConnector for TcpSentinelConnector {
    async fn connect(&self, sentinel: &HostAndPort) -> Result<Arc<dyn SentinelConnection>> {
        let address = sentinel.to_string();
        let stream = timeout(self.timeout, TcpStream::connect(&address))
            .await
            .with_context(|| format!("connect to sentinel {} timed out", address))??;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to set TCP_NODELAY for {}", address))?;
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(60));
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!(sentinel = %address, error = %err, "failed to set sentinel TCP keepalive");
        }
        let mut framed = Framed::new(stream, RespCodec);
        if let Some(auth) = &self.auth {
            auth.apply_to_stream(&mut framed, self.timeout, &address)
                .await?;
        }
        Ok(Arc::new(TcpSentinelConnection::spawn(sentinel.clone(), framed)))
    }
}

enum Op {
    Send(Command, oneshot::Sender<RespValue>),
    Expect(Vec<oneshot::Sender<RespValue>>),
    Close,
}

/// Connection driven by a background io task. Dropping the last handle
/// closes the socket.
#[derive(Debug)]
pub struct TcpSentinelConnection {
    sentinel: HostAndPort,
    valid: Arc<AtomicBool>,
    ops: mpsc::UnboundedSender<Op>,
}

impl TcpSentinelConnection {
    pub fn spawn(sentinel: HostAndPort, framed: Framed<TcpStream, RespCodec>) -> Self {
        let valid = Arc::new(AtomicBool::new(true));
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(sentinel.clone(), framed, rx, valid.clone()));
        Self {
            sentinel,
            valid,
            ops,
        }
    }

    pub fn sentinel(&self) -> &HostAndPort {
        &self.sentinel
    }
}

impl SentinelConnection for TcpSentinelConnection {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && !self.ops.is_closed()
    }

    fn send_command(&self, command: Command) -> ReplyCell {
        let (tx, rx) = oneshot::channel();
        // A closed channel drops `tx`, which resolves the cell with an error.
        let _ = self.ops.send(Op::Send(command, tx));
        rx
    }

    fn expect_replies(&self, count: usize) -> Vec<ReplyCell> {
        let (senders, cells): (Vec<_>, Vec<_>) = (0..count).map(|_| oneshot::channel()).unzip();
        let _ = self.ops.send(Op::Expect(senders));
        cells
    }

    fn close(&self) {
        self.valid.store(false, Ordering::Release);
        let _ = self.ops.send(Op::Close);
    }
}

async fn drive(
    sentinel: HostAndPort,
    mut framed: Framed<TcpStream, RespCodec>,
    mut ops: mpsc::UnboundedReceiver<Op>,
    valid: Arc<AtomicBool>,
) {
    let mut pending: VecDeque<oneshot::Sender<RespValue>> = VecDeque::new();
    loop {
        tokio::select! {
            biased;

            op = ops.recv() => match op {
                Some(Op::Send(command, cell)) => {
                    pending.push_back(cell);
                    if let Err(err) = framed.send(command).await {
                        warn!(sentinel = %sentinel, error = %err, "failed to write to sentinel");
                        break;
                    }
                }
                Some(Op::Expect(cells)) => pending.extend(cells),
                Some(Op::Close) | None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(value)) => match pending.pop_front() {
                    Some(cell) => {
                        let _ = cell.send(value);
                    }
                    None => debug!(sentinel = %sentinel, "dropping unsolicited sentinel frame"),
                },
                Some(Err(err)) => {
                    warn!(sentinel = %sentinel, error = %err, "sentinel connection failed");
                    break;
                }
                None => {
                    debug!(sentinel = %sentinel, "sentinel closed connection");
                    break;
                }
            },
        }
    }
    valid.store(false, Ordering::Release);
}
