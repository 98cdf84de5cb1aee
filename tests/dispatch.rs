use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::{ready, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

use transponder::auth::{AuthCommandProcessor, AuthUserConfig};
use transponder::backend::connector::UpstreamRequest;
use transponder::backend::pool::{ConnectionPool, Connector, SessionCommand};
use transponder::cluster::{ClusterModeConfig, ClusterNodeConfig, SlotClusterMode};
use transponder::limit::{ConnectLimitConfig, ConnectLimiter, TenantLimitConfig};
use transponder::plugin::{PluginChain, PluginRegistry, ProxyPlugin, ProxyPluginResponse, ProxyRequest};
use transponder::protocol::redis::{reply, Command, RedisCommand, RespValue};
use transponder::session::{ChannelInfo, ChannelTransport, Outbound};
use transponder::upstream::{
    HostAndPort, ReplyFuture, SentinelTopology, SentinelUpstreamTemplate, SingleTemplateFactory,
    Tenant, TenantTemplateBuilder, TenantTemplateFactory,
    UpstreamClientTemplate, UpstreamClientTemplateFactory,
};
use transponder::{CommandDispatcher, CommandInvokeConfig};

/// Answers every command with `<db>:<command>` and records each flush.
#[derive(Default)]
struct EchoTemplate {
    single_db: bool,
    flushes: Mutex<Vec<(i64, Vec<String>)>>,
}

impl EchoTemplate {
    fn flushes(&self) -> Vec<(i64, Vec<String>)> {
        self.flushes.lock().clone()
    }
}

impl UpstreamClientTemplate for EchoTemplate {
    fn send_command(&self, db: i64, commands: Vec<Command>) -> Result<Vec<ReplyFuture>> {
        self.flushes
            .lock()
            .push((db, commands.iter().map(|c| c.to_string()).collect()));
        Ok(commands
            .into_iter()
            .map(|command| ready(RespValue::bulk(format!("{}:{}", db, command))).boxed())
            .collect())
    }

    fn is_multi_db_support(&self) -> bool {
        !self.single_db
    }
}

/// Holds every reply until the test releases it.
#[derive(Default)]
struct ManualTemplate {
    pending: Mutex<Vec<(String, oneshot::Sender<RespValue>)>>,
}

impl ManualTemplate {
    fn release(&self, command: &str) {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .position(|(name, _)| name == command)
            .expect("pending command");
        let (name, tx) = pending.remove(index);
        let _ = tx.send(RespValue::bulk(name));
    }

    fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl UpstreamClientTemplate for ManualTemplate {
    fn send_command(&self, _db: i64, commands: Vec<Command>) -> Result<Vec<ReplyFuture>> {
        let mut replies: Vec<ReplyFuture> = Vec::new();
        for command in commands {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().push((command.to_string(), tx));
            replies.push(
                rx.map(|reply| reply.unwrap_or_else(|_| reply::upstream_not_available()))
                    .boxed(),
            );
        }
        Ok(replies)
    }

    fn is_multi_db_support(&self) -> bool {
        true
    }
}

struct FailingTemplate;

impl UpstreamClientTemplate for FailingTemplate {
    fn send_command(&self, _db: i64, _commands: Vec<Command>) -> Result<Vec<ReplyFuture>> {
        bail!("upstream pool exhausted")
    }

    fn is_multi_db_support(&self) -> bool {
        true
    }
}

struct Conn {
    channel: ChannelInfo,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Conn {
    fn new(capacity: usize) -> Self {
        let (transport, rx) = ChannelTransport::new(None);
        Self {
            channel: ChannelInfo::new(transport, capacity),
            rx,
        }
    }

    fn control(capacity: usize) -> Self {
        let (transport, rx) = ChannelTransport::new(None);
        Self {
            channel: ChannelInfo::new(transport, capacity).with_control_port(true),
            rx,
        }
    }

    async fn next(&mut self) -> Outbound {
        timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("outbound frame in time")
            .expect("transport channel open")
    }

    async fn reply(&mut self) -> RespValue {
        match self.next().await {
            Outbound::Reply(value) => value,
            Outbound::Close => panic!("connection closed while a reply was expected"),
        }
    }

    async fn assert_idle(&mut self) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert!(self.rx.try_recv().is_err(), "unexpected outbound frame");
    }
}

fn cmd(parts: &[&str]) -> Command {
    Command::from_parts(parts.iter().copied())
}

fn single(template: Arc<dyn UpstreamClientTemplate>) -> Arc<dyn UpstreamClientTemplateFactory> {
    Arc::new(SingleTemplateFactory::new(template))
}

fn dispatcher(template: Arc<dyn UpstreamClientTemplate>) -> CommandDispatcher {
    CommandDispatcher::new(single(template), CommandInvokeConfig::default())
}

fn tenant_auth() -> AuthCommandProcessor {
    AuthCommandProcessor::from_users(vec![
        AuthUserConfig {
            username: "default".into(),
            password: "root-pass".into(),
            tenant: None,
        },
        AuthUserConfig {
            username: "orders".into(),
            password: "orders-pass".into(),
            tenant: Some(Tenant::new(7, "orders")),
        },
    ])
    .unwrap()
}

#[tokio::test]
async fn replies_follow_submission_order() {
    let template = Arc::new(ManualTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "a"]), cmd(&["GET", "b"]), cmd(&["GET", "c"])],
    );
    assert_eq!(template.pending(), 3);

    template.release("GET c");
    template.release("GET a");
    assert_eq!(conn.reply().await, RespValue::bulk("GET a"));
    conn.assert_idle().await;

    template.release("GET b");
    assert_eq!(conn.reply().await, RespValue::bulk("GET b"));
    assert_eq!(conn.reply().await, RespValue::bulk("GET c"));
}

#[tokio::test]
async fn full_queue_closes_connection_once() {
    let template = Arc::new(ManualTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(2);

    dispatcher.transpond(&mut conn.channel, vec![cmd(&["GET", "a"])]);
    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "b"]), cmd(&["GET", "c"])],
    );

    assert_eq!(conn.reply().await, reply::too_busy());
    assert_eq!(conn.next().await, Outbound::Close);
    assert!(conn.channel.queue().is_cleared());

    // The command admitted before the overflow completes into a cleared
    // queue and never reaches the client.
    template.release("GET a");
    conn.assert_idle().await;
    assert_eq!(template.pending(), 0);
}

#[tokio::test]
async fn select_in_pipeline_splits_sub_batches() {
    let template = Arc::new(EchoTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![
            cmd(&["SELECT", "3"]),
            cmd(&["SET", "a", "1"]),
            cmd(&["GET", "a"]),
            cmd(&["SELECT", "5"]),
            cmd(&["GET", "a"]),
        ],
    );

    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, RespValue::bulk("3:SET a 1"));
    assert_eq!(conn.reply().await, RespValue::bulk("3:GET a"));
    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, RespValue::bulk("5:GET a"));
    assert_eq!(
        template.flushes(),
        vec![
            (3, vec!["SET a 1".to_string(), "GET a".to_string()]),
            (5, vec!["GET a".to_string()]),
        ]
    );
    assert_eq!(conn.channel.db(), 5);
}

#[tokio::test]
async fn select_validates_index() {
    let template = Arc::new(EchoTemplate {
        single_db: true,
        ..EchoTemplate::default()
    });
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![
            cmd(&["SELECT", "1"]),
            cmd(&["SELECT", "-1"]),
            cmd(&["SELECT", "db"]),
            cmd(&["SELECT"]),
        ],
    );
    assert_eq!(conn.reply().await, reply::db_index_out_of_range());
    assert_eq!(conn.reply().await, reply::db_index_out_of_range());
    assert_eq!(conn.reply().await, reply::not_integer());
    assert_eq!(conn.reply().await, reply::wrong_number_of_args("select"));
    assert_eq!(conn.channel.db(), 0);
    assert!(template.flushes().is_empty());
}

struct DenyKey(&'static str);

impl ProxyPlugin for DenyKey {
    fn name(&self) -> &str {
        "deny-key"
    }

    fn execute_request(&self, request: &ProxyRequest<'_>) -> Result<ProxyPluginResponse> {
        if request.command.arg(1).map(|key| &key[..]) == Some(self.0.as_bytes()) {
            return Ok(ProxyPluginResponse::Reply(RespValue::error("ERR key denied")));
        }
        Ok(ProxyPluginResponse::Pass)
    }
}

struct Broken(AtomicUsize);

impl ProxyPlugin for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn execute_request(&self, _request: &ProxyRequest<'_>) -> Result<ProxyPluginResponse> {
        self.0.fetch_add(1, Ordering::SeqCst);
        bail!("plugin state corrupted")
    }
}

#[tokio::test]
async fn plugin_reply_never_reaches_upstream() {
    let template = Arc::new(EchoTemplate::default());
    let broken = Arc::new(Broken(AtomicUsize::new(0)));
    let plugins = Arc::new(PluginRegistry::default());
    plugins.update(
        PluginChain::new()
            .with_request_plugin(broken.clone())
            .with_request_plugin(Arc::new(DenyKey("secret"))),
    );
    let dispatcher = CommandDispatcher::new(
        single(template.clone()),
        CommandInvokeConfig {
            plugins,
            ..CommandInvokeConfig::default()
        },
    );
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "secret"]), cmd(&["GET", "public"])],
    );
    assert_eq!(conn.reply().await, RespValue::error("ERR key denied"));
    assert_eq!(conn.reply().await, RespValue::bulk("0:GET public"));
    assert_eq!(template.flushes(), vec![(0, vec!["GET public".to_string()])]);
    assert_eq!(broken.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn subscribe_mode_restricts_commands() {
    let template = Arc::new(EchoTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(16);

    dispatcher.transpond(&mut conn.channel, vec![cmd(&["SUBSCRIBE", "news"])]);
    assert_eq!(conn.reply().await, RespValue::bulk("0:SUBSCRIBE news"));
    assert!(conn.channel.is_in_subscribe());

    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "k"]), cmd(&["PING"])],
    );
    assert_eq!(
        conn.reply().await,
        reply::not_allowed_while_subscribed(RedisCommand::Get.name())
    );
    assert_eq!(conn.reply().await, RespValue::bulk("0:PING"));
}

/// Upstream node answering `<command>@<node>` without a socket.
struct LoopbackConnector;

#[async_trait]
impl Connector<UpstreamRequest> for LoopbackConnector {
    async fn run_session(
        self: Arc<Self>,
        node: HostAndPort,
        mut rx: mpsc::Receiver<SessionCommand<UpstreamRequest>>,
    ) {
        while let Some(cmd) = rx.recv().await {
            let name = cmd.request.command.name_lossy();
            let _ = cmd
                .respond_to
                .send(Ok(RespValue::bulk(format!("{}@{}", name, node))));
        }
    }
}

#[tokio::test]
async fn pubsub_through_sentinel_upstream_is_refused_without_subscribe_mode() {
    let topology = Arc::new(SentinelTopology::new("mymaster"));
    topology.update_master(HostAndPort::new("10.0.0.1", 6379));
    let pool: Arc<ConnectionPool<UpstreamRequest>> =
        Arc::new(ConnectionPool::new(Arc::new(LoopbackConnector)));
    let template = Arc::new(SentinelUpstreamTemplate::new(topology, pool, false));
    let dispatcher = dispatcher(template);
    let mut conn = Conn::new(16);

    dispatcher.transpond(&mut conn.channel, vec![cmd(&["SUBSCRIBE", "ch"])]);
    assert_eq!(conn.reply().await, reply::not_support());
    assert!(!conn.channel.is_in_subscribe());

    dispatcher.transpond(
        &mut conn.channel,
        vec![
            cmd(&["GET", "k"]),
            cmd(&["PSUBSCRIBE", "news.*"]),
            cmd(&["UNSUBSCRIBE", "ch"]),
            cmd(&["GET", "k"]),
        ],
    );
    assert_eq!(conn.reply().await, RespValue::bulk("GET@10.0.0.1:6379"));
    assert_eq!(conn.reply().await, reply::not_support());
    assert_eq!(conn.reply().await, reply::not_support());
    assert_eq!(conn.reply().await, RespValue::bulk("GET@10.0.0.1:6379"));
    assert!(!conn.channel.is_in_subscribe());
}

#[tokio::test]
async fn session_commands_answered_locally() {
    let template = Arc::new(EchoTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::control(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![
            cmd(&["PING"]),
            cmd(&["ASKING"]),
            cmd(&["CONFIG", "SET", "notify-keyspace-events", "KEA"]),
            cmd(&["CONFIG", "GET", "maxmemory"]),
            cmd(&["CLUSTER", "INFO"]),
            cmd(&["NOSUCHCOMMAND"]),
            cmd(&["INFO", "connection"]),
        ],
    );
    assert_eq!(conn.reply().await, reply::pong());
    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, RespValue::bulk("0:CONFIG GET maxmemory"));
    assert_eq!(conn.reply().await, reply::not_support());
    assert_eq!(conn.reply().await, reply::not_support());
    let info = conn.reply().await;
    let body = info.as_bytes().expect("bulk info");
    assert!(body.starts_with(b"# Connection\r\n"));
    assert_eq!(
        template.flushes(),
        vec![(0, vec!["CONFIG GET maxmemory".to_string()])]
    );
}

#[tokio::test]
async fn quit_aborts_rest_of_batch() {
    let template = Arc::new(EchoTemplate::default());
    let dispatcher = dispatcher(template.clone());
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "a"]), cmd(&["QUIT"]), cmd(&["GET", "b"])],
    );
    assert_eq!(conn.next().await, Outbound::Close);
    conn.assert_idle().await;
    assert!(template.flushes().is_empty());
}

#[tokio::test]
async fn auth_gate_allows_cluster_heartbeat() {
    let template = Arc::new(EchoTemplate::default());
    let cluster = SlotClusterMode::from_config(&ClusterModeConfig {
        current_node: "10.0.0.1:6380".into(),
        nodes: vec![ClusterNodeConfig {
            addr: "10.0.0.1:6380".into(),
            slots: vec!["0-16383".into()],
        }],
        hash_tag: None,
    })
    .unwrap();
    let dispatcher = CommandDispatcher::new(
        single(template.clone()),
        CommandInvokeConfig {
            auth: tenant_auth(),
            cluster: Some(Arc::new(cluster)),
            ..CommandInvokeConfig::default()
        },
    );
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![
            cmd(&["GET", "k"]),
            cmd(&["cluster", "proxy_heartbeat", "10.0.0.2:6380"]),
            cmd(&["CLUSTER", "INFO"]),
            cmd(&["AUTH", "root-pass"]),
            cmd(&["GET", "k"]),
        ],
    );
    assert_eq!(conn.reply().await, reply::no_auth());
    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, reply::no_auth());
    assert_eq!(conn.reply().await, reply::ok());
    assert_eq!(conn.reply().await, RespValue::bulk("0:GET k"));
}

#[tokio::test]
async fn single_key_commands_are_redirected_in_cluster_mode() {
    let template = Arc::new(EchoTemplate::default());
    let cluster = SlotClusterMode::from_config(&ClusterModeConfig {
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
        hash_tag: None,
    })
    .unwrap();
    let dispatcher = CommandDispatcher::new(
        single(template.clone()),
        CommandInvokeConfig {
            cluster: Some(Arc::new(cluster)),
            ..CommandInvokeConfig::default()
        },
    );
    let mut conn = Conn::new(16);

    dispatcher.transpond(&mut conn.channel, vec![cmd(&["GET", "foo"])]);
    assert_eq!(conn.reply().await, RespValue::error("MOVED 12182 10.0.0.2:6380"));

    // Pipelined batches skip the redirection check.
    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "foo"]), cmd(&["GET", "bar"])],
    );
    assert_eq!(conn.reply().await, RespValue::bulk("0:GET foo"));
    assert_eq!(conn.reply().await, RespValue::bulk("0:GET bar"));
}

#[tokio::test]
async fn failed_auth_then_connect_limit_closes_without_reply_leak() {
    let template = Arc::new(EchoTemplate::default());
    let limiter = ConnectLimiter::new(&ConnectLimitConfig {
        default_threshold: None,
        tenants: vec![TenantLimitConfig {
            bid: 7,
            bgroup: "orders".into(),
            threshold: 1,
        }],
    });
    let dispatcher = CommandDispatcher::new(
        single(template.clone()),
        CommandInvokeConfig {
            auth: tenant_auth(),
            connect_limiter: limiter.clone(),
            ..CommandInvokeConfig::default()
        },
    );
    let tenant = Tenant::new(7, "orders");

    let mut first = Conn::new(16);
    dispatcher.transpond(&mut first.channel, vec![cmd(&["AUTH", "orders", "orders-pass"])]);
    assert_eq!(first.reply().await, reply::ok());
    assert!(first.channel.is_tenant_registered());
    assert_eq!(limiter.current(&tenant), 1);

    let mut second = Conn::new(16);
    dispatcher.transpond(
        &mut second.channel,
        vec![
            cmd(&["AUTH", "orders", "wrong"]),
            cmd(&["AUTH", "orders", "orders-pass"]),
            cmd(&["GET", "k"]),
        ],
    );
    let wrongpass = second.reply().await;
    assert!(wrongpass.is_error());
    assert_ne!(wrongpass, reply::too_many_connects());
    assert_eq!(second.reply().await, reply::too_many_connects());
    assert_eq!(second.next().await, Outbound::Close);
    second.assert_idle().await;
    assert!(!second.channel.is_tenant_registered());
    assert_eq!(limiter.current(&tenant), 1);
    assert!(template.flushes().is_empty());

    drop(first);
    assert_eq!(limiter.current(&tenant), 0);
}

#[tokio::test]
async fn template_error_fails_whole_sub_batch() {
    let dispatcher = dispatcher(Arc::new(FailingTemplate));
    let mut conn = Conn::new(16);

    dispatcher.transpond(
        &mut conn.channel,
        vec![cmd(&["GET", "a"]), cmd(&["SET", "b", "1"])],
    );
    assert_eq!(conn.reply().await, reply::upstream_not_available());
    assert_eq!(conn.reply().await, reply::upstream_not_available());

    // The connection stays usable.
    dispatcher.transpond(&mut conn.channel, vec![cmd(&["ASKING"])]);
    assert_eq!(conn.reply().await, reply::ok());
}

struct OrdersOnly(Arc<EchoTemplate>);

#[async_trait]
impl TenantTemplateBuilder for OrdersOnly {
    async fn build(&self, tenant: &Tenant) -> Result<Option<Arc<dyn UpstreamClientTemplate>>> {
        tokio::task::yield_now().await;
        if tenant.bgroup == "orders" {
            return Ok(Some(self.0.clone()));
        }
        Ok(None)
    }
}

#[tokio::test]
async fn tenant_templates_initialise_asynchronously() {
    let tenant_template = Arc::new(EchoTemplate::default());
    let factory = Arc::new(TenantTemplateFactory::new(
        None,
        Arc::new(OrdersOnly(tenant_template.clone())),
    ));
    let dispatcher = CommandDispatcher::new(
        factory.clone(),
        CommandInvokeConfig {
            auth: tenant_auth(),
            ..CommandInvokeConfig::default()
        },
    );

    let mut tenant_conn = Conn::new(16);
    dispatcher.transpond(
        &mut tenant_conn.channel,
        vec![cmd(&["AUTH", "orders", "orders-pass"]), cmd(&["GET", "k"])],
    );
    assert_eq!(tenant_conn.reply().await, reply::ok());
    assert_eq!(tenant_conn.reply().await, RespValue::bulk("0:GET k"));
    assert_eq!(factory.cached_tenants(), 1);

    // Warmed tenants are served inline.
    dispatcher.transpond(&mut tenant_conn.channel, vec![cmd(&["GET", "again"])]);
    assert_eq!(tenant_conn.reply().await, RespValue::bulk("0:GET again"));

    // Without a tenant and without a default template nothing can serve.
    let mut anonymous = Conn::new(16);
    dispatcher.transpond(
        &mut anonymous.channel,
        vec![cmd(&["AUTH", "root-pass"]), cmd(&["GET", "k"])],
    );
    assert_eq!(anonymous.reply().await, reply::ok());
    assert_eq!(anonymous.reply().await, reply::upstream_not_available());
}
