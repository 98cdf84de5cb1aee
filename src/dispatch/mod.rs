//! Per-batch command dispatch.
//!
//! A batch is every command decoded from one read of a client connection.
//! Each command first takes a slot in the connection's reply queue, so the
//! client sees replies in request order however the commands complete.
//! Commands that survive the session rules accumulate into a sub-batch
//! that is flushed to the tenant's upstream template; a `SELECT` to another
//! database closes the current sub-batch.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::auth::{invoke_client_command, AuthCommandProcessor};
use crate::cluster::ClusterModeProcessor;
use crate::info::{info_command, InfoContext};
use crate::limit::{ConnectLimiter, LimitExceeded};
use crate::metrics;
use crate::plugin::{PluginChain, PluginRegistry, ProxyRequest};
use crate::protocol::redis::{
    reply, Command, CommandType, RedisCommand, RespValue, SupportType,
};
use crate::session::{ChannelInfo, ChannelStats};
use crate::task::CommandTask;
use crate::upstream::{Tenant, UpstreamClientTemplate, UpstreamClientTemplateFactory};
use crate::utils::parse_i64;

/// Collaborators of the dispatcher besides the template factory.
#[derive(Clone)]
pub struct CommandInvokeConfig {
    pub auth: AuthCommandProcessor,
    pub cluster: Option<Arc<dyn ClusterModeProcessor>>,
    pub plugins: Arc<PluginRegistry>,
    pub connect_limiter: ConnectLimiter,
}

impl Default for CommandInvokeConfig {
    fn default() -> Self {
        Self {
            auth: AuthCommandProcessor::disabled(),
            cluster: None,
            plugins: Arc::new(PluginRegistry::default()),
            connect_limiter: ConnectLimiter::unlimited(),
        }
    }
}

/// What the batch loop does after one command.
enum Step {
    Next,
    Abort,
}

// Labels of the command outcome counter.
const RESULT_PLUGIN: &str = "plugin";
const RESULT_REJECTED: &str = "rejected";
const RESULT_LOCAL: &str = "local";
const RESULT_UPSTREAM: &str = "upstream";

pub struct CommandDispatcher {
    factory: Arc<dyn UpstreamClientTemplateFactory>,
    auth: AuthCommandProcessor,
    cluster: Option<Arc<dyn ClusterModeProcessor>>,
    plugins: Arc<PluginRegistry>,
    connect_limiter: ConnectLimiter,
}

impl CommandDispatcher {
    pub fn new(factory: Arc<dyn UpstreamClientTemplateFactory>, config: CommandInvokeConfig) -> Self {
        Self {
            factory,
            auth: config.auth,
            cluster: config.cluster,
            plugins: config.plugins,
            connect_limiter: config.connect_limiter,
        }
    }

    /// Registry whose chain is picked up by the next batch.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn connect_limiter(&self) -> &ConnectLimiter {
        &self.connect_limiter
    }

    /// Dispatches one receive batch. Never waits on the network: upstream
    /// replies, INFO, CLUSTER and tenant initialisation complete on spawned
    /// tasks. A fault escaping the batch closes the connection.
    pub fn transpond(&self, channel: &mut ChannelInfo, commands: Vec<Command>) {
        if let Err(err) = self.transpond0(channel, commands) {
            metrics::error_incr("dispatch");
            error!(
                consid = channel.consid(),
                tenant = ?channel.tenant().map(Tenant::to_string),
                peer = ?channel.transport().peer(),
                error = %err,
                "commands transponder error, client connection will be force closed"
            );
            channel.transport().close();
        }
    }

    fn transpond0(&self, channel: &mut ChannelInfo, commands: Vec<Command>) -> Result<()> {
        let runtime = Handle::try_current().context("command dispatch requires a tokio runtime")?;
        debug!(
            consid = channel.consid(),
            size = commands.len(),
            commands = %CommandNames(&commands),
            "receive commands"
        );

        let chain = self.plugins.load();
        let pipelined = commands.len() > 1;
        let mut tasks: Vec<CommandTask> = Vec::with_capacity(commands.len());

        for mut command in commands {
            command.bind_client(channel.client_id());
            let Some(task) = channel.queue().add(command, chain.clone()) else {
                metrics::error_incr("queue_full");
                warn!(
                    consid = channel.consid(),
                    peer = ?channel.transport().peer(),
                    capacity = channel.queue().capacity(),
                    "command task queue full, client connection will be closed"
                );
                channel.queue().clear();
                channel.transport().write_and_close(reply::too_busy());
                return Ok(());
            };
            match self.process(&runtime, channel, &chain, pipelined, task, &mut tasks) {
                Step::Next => {}
                Step::Abort => return Ok(()),
            }
        }

        if !tasks.is_empty() {
            self.flush(&runtime, channel.tenant().cloned(), channel.db(), tasks);
        }
        Ok(())
    }

    fn process(
        &self,
        runtime: &Handle,
        channel: &mut ChannelInfo,
        chain: &PluginChain,
        pipelined: bool,
        task: CommandTask,
        tasks: &mut Vec<CommandTask>,
    ) -> Step {
        if chain.has_request_plugins() {
            let request = ProxyRequest {
                db: channel.db(),
                command: task.command(),
                tenant: channel.tenant(),
                factory: self.factory.as_ref(),
            };
            if let Some(reply) = chain.execute_request(&request) {
                record(task.command(), RESULT_PLUGIN);
                task.reply_from_plugin(reply);
                return Step::Next;
            }
        }

        let redis_command = match task.command().redis_command() {
            Some(command) if command.support_type() == SupportType::Support => command,
            _ => {
                debug!(
                    consid = channel.consid(),
                    command = %task.command().name_lossy(),
                    "command not supported"
                );
                reject(task, reply::not_support());
                return Step::Next;
            }
        };

        if channel.is_in_subscribe() && !redis_command.allowed_in_subscribe() {
            reject(task, reply::not_allowed_while_subscribed(redis_command.name()));
            return Step::Next;
        }

        let session_command = redis_command.command_type() == CommandType::Db;
        if session_command {
            match redis_command {
                RedisCommand::Ping if channel.is_from_control_port() => {
                    local(task, reply::pong());
                    return Step::Next;
                }
                RedisCommand::Quit => {
                    record(task.command(), RESULT_LOCAL);
                    channel.queue().clear();
                    channel.transport().close();
                    return Step::Abort;
                }
                RedisCommand::Auth | RedisCommand::Hello => {
                    let had_tenant = channel.tenant().is_some();
                    let reply = if redis_command == RedisCommand::Auth {
                        self.auth.invoke_auth_command(channel, task.command())
                    } else {
                        self.auth.invoke_hello_command(channel, task.command())
                    };
                    if !had_tenant && !self.check_connect_limit(channel) {
                        return Step::Abort;
                    }
                    local(task, reply);
                    return Step::Next;
                }
                _ => {}
            }
        }

        if self.auth.is_password_required() && channel.channel_stats() != ChannelStats::AuthOk {
            let heartbeat = redis_command == RedisCommand::Cluster
                && task.command().arg_eq_ignore_case(1, b"PROXY_HEARTBEAT");
            if !heartbeat {
                reject(task, reply::no_auth());
                return Step::Next;
            }
        }

        if session_command {
            match redis_command {
                RedisCommand::Select => {
                    self.select(runtime, channel, task, tasks);
                    return Step::Next;
                }
                RedisCommand::Info => {
                    record(task.command(), RESULT_LOCAL);
                    let reply = info_command(self.info_context(channel), task.command());
                    runtime.spawn(async move { task.reply_completed(reply.await) });
                    return Step::Next;
                }
                RedisCommand::Client => {
                    let had_tenant = channel.tenant().is_some();
                    let reply = invoke_client_command(channel, task.command());
                    if !had_tenant && !self.check_connect_limit(channel) {
                        return Step::Abort;
                    }
                    local(task, reply);
                    return Step::Next;
                }
                RedisCommand::Asking => {
                    local(task, reply::ok());
                    return Step::Next;
                }
                RedisCommand::Config
                    if task.command().len() > 1 && !task.command().arg_eq_ignore_case(1, b"GET") =>
                {
                    // Session libraries issue CONFIG SET for keyspace
                    // notifications; acknowledge without applying it.
                    local(task, reply::ok());
                    return Step::Next;
                }
                RedisCommand::Cluster => {
                    match &self.cluster {
                        Some(cluster) => {
                            record(task.command(), RESULT_LOCAL);
                            let reply = cluster.cluster_commands(task.command());
                            runtime.spawn(async move { task.reply_completed(reply.await) });
                        }
                        None => reject(task, reply::not_support()),
                    }
                    return Step::Next;
                }
                _ => {}
            }
        }

        if !pipelined {
            if let Some(cluster) = &self.cluster {
                if let Some(redirect) = cluster.is_command_move(task.command()) {
                    local(task, redirect);
                    return Step::Next;
                }
            }
        }

        if redis_command.is_pubsub() {
            let unsupported = self
                .factory
                .try_get(channel.tenant())
                .map(|template| !template.is_pubsub_support())
                .unwrap_or(false);
            if unsupported {
                reject(task, reply::not_support());
                return Step::Next;
            }
            if redis_command.is_subscribe() {
                channel.set_in_subscribe(true);
            }
        }

        record(task.command(), RESULT_UPSTREAM);
        tasks.push(task);
        Step::Next
    }

    fn select(
        &self,
        runtime: &Handle,
        channel: &mut ChannelInfo,
        task: CommandTask,
        tasks: &mut Vec<CommandTask>,
    ) {
        if task.command().len() != 2 {
            reject(task, reply::wrong_number_of_args("select"));
            return;
        }
        let Some(db) = task.command().arg(1).and_then(|arg| parse_i64(arg)) else {
            reject(task, reply::not_integer());
            return;
        };
        if db < 0 {
            reject(task, reply::db_index_out_of_range());
            return;
        }
        if let Some(template) = self.factory.try_get(channel.tenant()) {
            if !template.is_multi_db_support() {
                reject(task, reply::db_index_out_of_range());
                return;
            }
        }
        if !tasks.is_empty() && channel.db() != db {
            let pending = std::mem::take(tasks);
            self.flush(runtime, channel.tenant().cloned(), channel.db(), pending);
        }
        channel.set_db(db);
        local(task, reply::ok());
    }

    /// Registers a newly tenant-scoped connection against its tenant's
    /// limit. On rejection the connection is closed and nothing more is
    /// written to it.
    fn check_connect_limit(&self, channel: &mut ChannelInfo) -> bool {
        let Some(tenant) = channel.tenant().cloned() else {
            return true;
        };
        if channel.is_tenant_registered() {
            return true;
        }
        match self.connect_limiter.try_register(&tenant) {
            Ok(guard) => {
                channel.set_tenant_guard(guard);
                true
            }
            Err(LimitExceeded { current, threshold }) => {
                metrics::error_incr("too_many_connects");
                warn!(
                    consid = channel.consid(),
                    tenant = %tenant,
                    current,
                    threshold,
                    peer = ?channel.transport().peer(),
                    "too many connects, connection will be force closed"
                );
                channel.queue().clear();
                channel.transport().write_and_close(reply::too_many_connects());
                false
            }
        }
    }

    fn info_context(&self, channel: &ChannelInfo) -> InfoContext {
        InfoContext {
            consid: channel.consid(),
            db: channel.db(),
            tenant: channel.tenant().cloned(),
            client_name: channel
                .client_name()
                .map(|name| String::from_utf8_lossy(name).into_owned()),
            cluster_mode: self.cluster.is_some(),
            multi_tenants: self.factory.is_multi_tenants_support(),
            upstream: self
                .factory
                .try_get(channel.tenant())
                .map(|template| template.is_multi_db_support()),
        }
    }

    /// Sends one sub-batch. Single-tenant deployments, tenant-less
    /// connections and warmed tenants resolve their template inline; other
    /// tenants wait for asynchronous initialisation.
    fn flush(&self, runtime: &Handle, tenant: Option<Tenant>, db: i64, tasks: Vec<CommandTask>) {
        let multi_tenant = tenant
            .as_ref()
            .filter(|tenant| tenant.is_routable() && self.factory.is_multi_tenants_support());
        let Some(routed) = multi_tenant else {
            let template = self.factory.get_or_initialize(tenant.as_ref());
            if let Some(done) = send_batch(template, tenant.as_ref(), db, tasks) {
                runtime.spawn(done);
            }
            return;
        };

        if let Some(template) = self.factory.try_get(Some(routed)) {
            if let Some(done) = send_batch(Some(template), Some(routed), db, tasks) {
                runtime.spawn(done);
            }
            return;
        }

        match self.factory.get_or_initialize_async(routed) {
            Some(init) => {
                let tenant = routed.clone();
                runtime.spawn(async move {
                    let template = init.await;
                    if let Some(done) = send_batch(template, Some(&tenant), db, tasks) {
                        done.await;
                    }
                });
            }
            None => {
                metrics::error_incr("upstream_unavailable");
                warn!(tenant = %routed, "tenant has no upstream, commands rejected");
                complete_all(tasks, reply::upstream_not_available);
            }
        }
    }
}

/// Hands `tasks` to `template` and returns the future completing them, or
/// `None` when every task was already completed with an error.
fn send_batch(
    template: Option<Arc<dyn UpstreamClientTemplate>>,
    tenant: Option<&Tenant>,
    db: i64,
    tasks: Vec<CommandTask>,
) -> Option<BoxFuture<'static, ()>> {
    let Some(template) = template else {
        metrics::error_incr("upstream_unavailable");
        warn!(
            tenant = ?tenant.map(Tenant::to_string),
            size = tasks.len(),
            "no upstream template, commands rejected"
        );
        complete_all(tasks, reply::upstream_not_available);
        return None;
    };

    let commands: Vec<Command> = tasks.iter().map(|task| task.command().clone()).collect();
    let replies = match template.send_command(db, commands) {
        Ok(replies) => replies,
        Err(err) => {
            metrics::error_incr("upstream_send");
            warn!(
                tenant = ?tenant.map(Tenant::to_string),
                db,
                error = %err,
                "upstream template send_command error"
            );
            complete_all(tasks, reply::upstream_not_available);
            return None;
        }
    };
    if replies.len() != tasks.len() {
        metrics::error_incr("upstream_misaligned");
        warn!(
            expected = tasks.len(),
            actual = replies.len(),
            "upstream returned a reply count different from the command count"
        );
    }

    Some(
        async move {
            // Unmatched tasks are dropped with the iterator and complete as
            // unavailable.
            for (task, reply) in tasks.into_iter().zip(replies) {
                task.reply_completed(reply.await);
            }
        }
        .boxed(),
    )
}

fn complete_all(tasks: Vec<CommandTask>, reply: fn() -> RespValue) {
    for task in tasks {
        task.reply_completed(reply());
    }
}

fn record(command: &Command, result: &str) {
    let name = command
        .redis_command()
        .map(RedisCommand::name)
        .unwrap_or("unknown");
    metrics::command_incr(name, result);
}

fn local(task: CommandTask, reply: RespValue) {
    record(task.command(), RESULT_LOCAL);
    task.reply_completed(reply);
}

fn reject(task: CommandTask, reply: RespValue) {
    record(task.command(), RESULT_REJECTED);
    task.reply_completed(reply);
}

/// Lazily formatted command names of a batch, for debug logs.
struct CommandNames<'a>(&'a [Command]);

impl fmt::Display for CommandNames<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, command) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&command.name_lossy())?;
        }
        f.write_str("]")
    }
}
