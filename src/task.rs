//! In-order reply queue.
//!
//! Every command of a connection takes a slot at the tail of its queue when
//! it is dispatched. Completions may arrive in any order; a completed reply
//! is released to the transport only once every slot ahead of it has been
//! released, so the client always sees replies in request order.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::plugin::{PluginChain, ProxyReply};
use crate::protocol::redis::{reply, Command, RespValue};
use crate::session::Transport;

pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 10000;

#[derive(Clone)]
pub struct CommandTaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    capacity: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    slots: VecDeque<Option<RespValue>>,
    head_seq: u64,
    cleared: bool,
}

impl CommandTaskQueue {
    pub fn new(capacity: usize, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                capacity: capacity.max(1),
                transport,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Appends a slot for `command`. Returns `None` when the queue is full
    /// or has been cleared; the caller must then tear the connection down.
    pub fn add(&self, command: Command, plugins: Arc<PluginChain>) -> Option<CommandTask> {
        let mut state = self.inner.state.lock();
        if state.cleared || state.slots.len() >= self.inner.capacity {
            return None;
        }
        let seq = state.head_seq + state.slots.len() as u64;
        state.slots.push_back(None);
        Some(CommandTask {
            queue: self.clone(),
            seq,
            command,
            plugins,
            completed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Drops every pending slot and detaches the queue: completions that
    /// arrive later are discarded and nothing more is written.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.slots.clear();
        state.cleared = true;
    }

    pub fn is_cleared(&self) -> bool {
        self.inner.state.lock().cleared
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    fn complete(&self, seq: u64, reply: RespValue) {
        let mut state = self.inner.state.lock();
        if state.cleared || seq < state.head_seq {
            debug!(seq, "reply for detached slot discarded");
            return;
        }
        let index = (seq - state.head_seq) as usize;
        match state.slots.get_mut(index) {
            Some(slot) => *slot = Some(reply),
            None => return,
        }
        while let Some(Some(_)) = state.slots.front() {
            if let Some(Some(ready)) = state.slots.pop_front() {
                state.head_seq += 1;
                self.inner.transport.write(ready);
            }
        }
    }
}

/// Handle to one slot of a [`CommandTaskQueue`]. Consumed by completion, so
/// a slot is completed at most once; dropping an uncompleted task completes
/// its slot with `upstream not available` to keep the queue head moving.
pub struct CommandTask {
    queue: CommandTaskQueue,
    seq: u64,
    command: Command,
    plugins: Arc<PluginChain>,
    completed: bool,
}

impl CommandTask {
    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn reply_completed(mut self, reply: RespValue) {
        self.finish(reply, false);
    }

    /// Completion with a reply produced by a request plugin.
    pub fn reply_from_plugin(mut self, reply: RespValue) {
        self.finish(reply, true);
    }

    fn finish(&mut self, reply: RespValue, from_plugin: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        // a cleared queue never writes the reply, so plugins must not see it
        if !self.queue.is_cleared() {
            self.plugins.execute_reply(&ProxyReply {
                command: self.command.redis_command(),
                reply: &reply,
                from_plugin,
            });
        }
        self.queue.complete(self.seq, reply);
    }
}

impl Drop for CommandTask {
    fn drop(&mut self) {
        if !self.completed {
            self.finish(reply::upstream_not_available(), false);
        }
    }
}

impl std::fmt::Debug for CommandTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTask")
            .field("seq", &self.seq)
            .field("command", &self.command)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ReplyPlugin;
    use crate::session::{ChannelTransport, Outbound};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn queue(capacity: usize) -> (CommandTaskQueue, UnboundedReceiver<Outbound>) {
        let (transport, rx) = ChannelTransport::new(None);
        (CommandTaskQueue::new(capacity, transport), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn chain() -> Arc<PluginChain> {
        Arc::new(PluginChain::default())
    }

    #[test]
    fn out_of_order_completion_is_written_in_order() {
        let (queue, mut rx) = queue(8);
        let tasks: Vec<_> = (0..3)
            .map(|i| {
                let key = format!("k{i}");
                queue
                    .add(Command::from_parts(["GET", key.as_str()]), chain())
                    .unwrap()
            })
            .collect();
        let mut tasks = tasks.into_iter();
        let (t0, t1, t2) = (
            tasks.next().unwrap(),
            tasks.next().unwrap(),
            tasks.next().unwrap(),
        );

        t2.reply_completed(RespValue::bulk("2"));
        t1.reply_completed(RespValue::bulk("1"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(queue.len(), 3);

        t0.reply_completed(RespValue::bulk("0"));
        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound::Reply(RespValue::bulk("0")),
                Outbound::Reply(RespValue::bulk("1")),
                Outbound::Reply(RespValue::bulk("2")),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn every_permutation_keeps_order() {
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 2, 1],
            [1, 0, 3, 2],
        ];
        for order in orders {
            let (queue, mut rx) = queue(8);
            let mut tasks: Vec<Option<CommandTask>> = (0..4)
                .map(|_| queue.add(Command::from_parts(["PING"]), chain()))
                .collect();
            for index in order {
                tasks[index]
                    .take()
                    .unwrap()
                    .reply_completed(RespValue::Integer(index as i64));
            }
            let written: Vec<_> = drain(&mut rx)
                .into_iter()
                .map(|frame| match frame {
                    Outbound::Reply(RespValue::Integer(n)) => n,
                    other => panic!("unexpected frame {:?}", other),
                })
                .collect();
            assert_eq!(written, vec![0, 1, 2, 3], "completion order {:?}", order);
        }
    }

    #[test]
    fn full_queue_rejects() {
        let (queue, _rx) = queue(2);
        let _a = queue.add(Command::from_parts(["PING"]), chain()).unwrap();
        let _b = queue.add(Command::from_parts(["PING"]), chain()).unwrap();
        assert!(queue.add(Command::from_parts(["PING"]), chain()).is_none());
    }

    #[test]
    fn cleared_queue_discards_completions() {
        let (queue, mut rx) = queue(4);
        let task = queue.add(Command::from_parts(["GET", "k"]), chain()).unwrap();
        queue.clear();
        task.reply_completed(RespValue::bulk("v"));
        assert!(drain(&mut rx).is_empty());
        assert!(queue.add(Command::from_parts(["GET", "k"]), chain()).is_none());
    }

    #[test]
    fn dropped_task_completes_with_upstream_not_available() {
        let (queue, mut rx) = queue(4);
        let dropped = queue.add(Command::from_parts(["GET", "a"]), chain()).unwrap();
        let kept = queue.add(Command::from_parts(["GET", "b"]), chain()).unwrap();
        kept.reply_completed(RespValue::bulk("b"));
        drop(dropped);
        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound::Reply(reply::upstream_not_available()),
                Outbound::Reply(RespValue::bulk("b")),
            ]
        );
    }

    struct CountReplies(AtomicUsize);

    impl ReplyPlugin for CountReplies {
        fn name(&self) -> &str {
            "count-replies"
        }

        fn execute_reply(&self, _reply: &ProxyReply<'_>) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn reply_plugins_skip_replies_of_a_cleared_queue() {
        let (queue, mut rx) = queue(4);
        let counter = Arc::new(CountReplies(AtomicUsize::new(0)));
        let chain = Arc::new(PluginChain::new().with_reply_plugin(counter.clone()));

        let answered = queue.add(Command::from_parts(["GET", "a"]), chain.clone()).unwrap();
        answered.reply_completed(RespValue::bulk("a"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let dropped = queue.add(Command::from_parts(["GET", "b"]), chain.clone()).unwrap();
        let late = queue.add(Command::from_parts(["GET", "c"]), chain).unwrap();
        queue.clear();
        drop(dropped);
        late.reply_completed(RespValue::bulk("c"));

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx), vec![Outbound::Reply(RespValue::bulk("a"))]);
    }
}
