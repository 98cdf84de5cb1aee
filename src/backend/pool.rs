use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::client::{session_request_channel, ClientId, RequestTx};
use crate::upstream::HostAndPort;

/// Request type carried to upstream session workers.
pub trait BackendRequest: Send + Sync + 'static {
    type Response: Send + 'static;

    fn apply_tracker(&mut self, node: &HostAndPort);
}

/// Request sent to a session worker together with its reply slot.
pub struct SessionCommand<T: BackendRequest> {
    pub request: T,
    pub respond_to: oneshot::Sender<Result<T::Response>>,
}

/// Connector runs one session worker per pooled slot.
#[async_trait]
pub trait Connector<T>: Send + Sync + 'static
where
    T: BackendRequest,
{
    async fn run_session(self: Arc<Self>, node: HostAndPort, rx: mpsc::Receiver<SessionCommand<T>>);
}

struct SessionHandle<T: BackendRequest> {
    tx: RequestTx<SessionCommand<T>>,
    join: JoinHandle<()>,
}

/// Pool mapping (node, client) to session workers. A client always lands
/// on the same worker of a node, so its requests to that node stay in
/// order.
pub struct ConnectionPool<T: BackendRequest> {
    connector: Arc<dyn Connector<T>>,
    sessions: RwLock<HashMap<HostAndPort, Vec<Option<SessionHandle<T>>>>>,
    slots_per_node: usize,
}

impl<T: BackendRequest> ConnectionPool<T> {
    pub fn new(connector: Arc<dyn Connector<T>>) -> Self {
        Self::with_slots(connector, DEFAULT_SLOTS_PER_NODE)
    }

    pub fn with_slots(connector: Arc<dyn Connector<T>>, slots_per_node: usize) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
            slots_per_node: slots_per_node.max(1),
        }
    }

    /// Enqueues `request` without waiting. Must be called from within a
    /// tokio runtime: session workers are spawned lazily.
    pub fn dispatch(
        &self,
        node: &HostAndPort,
        client_id: ClientId,
        mut request: T,
    ) -> Result<oneshot::Receiver<Result<T::Response>>> {
        let index = session_index(node, client_id, self.slots_per_node);
        let tx = {
            let mut guard = self.sessions.write();
            let slots = guard.entry(node.clone()).or_insert_with(|| {
                let mut slots = Vec::with_capacity(self.slots_per_node);
                slots.resize_with(self.slots_per_node, || None);
                slots
            });
            let entry = &mut slots[index];
            if entry.as_ref().map(|h| h.tx.is_closed()).unwrap_or(false) {
                *entry = None;
            }
            let handle = entry.get_or_insert_with(|| {
                let (tx, rx) = session_request_channel();
                let connector = self.connector.clone();
                let node = node.clone();
                let join = tokio::spawn(async move { connector.run_session(node, rx).await });
                SessionHandle { tx, join }
            });
            handle.tx.clone()
        };

        request.apply_tracker(node);

        let (respond_to, response_rx) = oneshot::channel();
        match tx.try_send(SessionCommand {
            request,
            respond_to,
        }) {
            Ok(()) => Ok(response_rx),
            Err(TrySendError::Full(_)) => Err(anyhow!("upstream session for {} is saturated", node)),
            Err(TrySendError::Closed(_)) => {
                let mut guard = self.sessions.write();
                if let Some(slots) = guard.get_mut(node) {
                    slots[index] = None;
                    if slots.iter().all(|slot| slot.is_none()) {
                        guard.remove(node);
                    }
                }
                Err(anyhow!("upstream session for {} is closed", node))
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .map(|slots| slots.iter().filter(|slot| slot.is_some()).count())
            .sum()
    }

    /// Stops every session worker of nodes no longer in `keep`.
    pub fn retain_nodes(&self, keep: &[HostAndPort]) {
        let mut guard = self.sessions.write();
        guard.retain(|node, slots| {
            let retained = keep.contains(node);
            if !retained {
                for handle in slots.iter_mut().filter_map(Option::take) {
                    handle.join.abort();
                }
            }
            retained
        });
    }
}

impl<T: BackendRequest> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        for slots in self.sessions.get_mut().values_mut() {
            for handle in slots.iter_mut().filter_map(Option::take) {
                handle.join.abort();
            }
        }
    }
}

pub const DEFAULT_SLOTS_PER_NODE: usize = 8;

fn session_index(node: &HostAndPort, client_id: ClientId, slots: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    node.hash(&mut hasher);
    client_id.as_u64().hash(&mut hasher);
    (hasher.finish() as usize) % slots.max(1)
}
