//! Per-connection session state and the outbound transport capability.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::backend::client::ClientId;
use crate::limit::TenantConnectionGuard;
use crate::protocol::redis::RespValue;
use crate::task::CommandTaskQueue;
use crate::upstream::Tenant;

/// Write side of a client connection. Implementations must be cheap and
/// non-blocking: replies are written while the reply queue is locked.
pub trait Transport: Send + Sync {
    fn write(&self, reply: RespValue);

    fn close(&self);

    /// Writes a final reply and closes; nothing written afterwards reaches
    /// the client.
    fn write_and_close(&self, reply: RespValue) {
        self.write(reply);
        self.close();
    }

    fn is_closed(&self) -> bool;

    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply(RespValue),
    Close,
}

/// Transport that hands frames to the connection's writer task over an
/// unbounded channel. Close is delivered at most once; writes after close
/// are dropped.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    peer: Option<SocketAddr>,
}

impl ChannelTransport {
    pub fn new(peer: Option<SocketAddr>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
            peer,
        });
        (transport, rx)
    }
}

impl Transport for ChannelTransport {
    fn write(&self, reply: RespValue) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(Outbound::Reply(reply));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStats {
    NoAuth,
    AuthOk,
}

/// State of one client connection. Owned by the connection's dispatch path
/// and never shared, so no field needs a lock.
pub struct ChannelInfo {
    client_id: ClientId,
    db: i64,
    tenant: Option<Tenant>,
    stats: ChannelStats,
    in_subscribe: bool,
    from_control_port: bool,
    client_name: Option<Bytes>,
    user: Option<String>,
    queue: CommandTaskQueue,
    transport: Arc<dyn Transport>,
    tenant_guard: Option<TenantConnectionGuard>,
}

impl ChannelInfo {
    pub fn new(transport: Arc<dyn Transport>, queue_capacity: usize) -> Self {
        let queue = CommandTaskQueue::new(queue_capacity, transport.clone());
        Self {
            client_id: ClientId::new(),
            db: 0,
            tenant: None,
            stats: ChannelStats::NoAuth,
            in_subscribe: false,
            from_control_port: false,
            client_name: None,
            user: None,
            queue,
            transport,
            tenant_guard: None,
        }
    }

    /// Marks the connection as arriving on the internal control port.
    pub fn with_control_port(mut self, from_control_port: bool) -> Self {
        self.from_control_port = from_control_port;
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn consid(&self) -> u64 {
        self.client_id.as_u64()
    }

    pub fn db(&self) -> i64 {
        self.db
    }

    pub fn set_db(&mut self, db: i64) {
        self.db = db;
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.tenant.as_ref()
    }

    pub fn set_tenant(&mut self, tenant: Option<Tenant>) {
        self.tenant = tenant;
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn set_channel_stats(&mut self, stats: ChannelStats) {
        self.stats = stats;
    }

    pub fn is_in_subscribe(&self) -> bool {
        self.in_subscribe
    }

    pub fn set_in_subscribe(&mut self, in_subscribe: bool) {
        self.in_subscribe = in_subscribe;
    }

    pub fn is_from_control_port(&self) -> bool {
        self.from_control_port
    }

    pub fn client_name(&self) -> Option<&Bytes> {
        self.client_name.as_ref()
    }

    pub fn set_client_name(&mut self, name: Option<Bytes>) {
        self.client_name = name;
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_user(&mut self, user: Option<String>) {
        self.user = user;
    }

    pub fn queue(&self) -> &CommandTaskQueue {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_tenant_registered(&self) -> bool {
        self.tenant_guard.is_some()
    }

    pub(crate) fn set_tenant_guard(&mut self, guard: TenantConnectionGuard) {
        self.tenant_guard = Some(guard);
    }
}

impl std::fmt::Debug for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelInfo")
            .field("consid", &self.consid())
            .field("db", &self.db)
            .field("tenant", &self.tenant)
            .field("stats", &self.stats)
            .field("in_subscribe", &self.in_subscribe)
            .finish()
    }
}
