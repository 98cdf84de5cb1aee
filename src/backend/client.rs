use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Sequential identifier for client connections; doubles as the log
/// `consid` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests buffered per upstream session before enqueueing fails.
pub const SESSION_CHANNEL_CAPACITY: usize = 1024;

pub type RequestTx<T> = mpsc::Sender<T>;
pub type RequestRx<T> = mpsc::Receiver<T>;

pub fn session_request_channel<T>() -> (RequestTx<T>, RequestRx<T>) {
    mpsc::channel(SESSION_CHANNEL_CAPACITY)
}
