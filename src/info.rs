use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::Lazy;

use crate::metrics;
use crate::protocol::redis::{Command, RespValue};
use crate::upstream::Tenant;

static START_TIME: Lazy<SystemTime> = Lazy::new(SystemTime::now);

/// Connection and deployment facts an INFO reply is rendered from.
#[derive(Debug, Clone)]
pub struct InfoContext {
    pub consid: u64,
    pub db: i64,
    pub tenant: Option<Tenant>,
    pub client_name: Option<String>,
    pub cluster_mode: bool,
    pub multi_tenants: bool,
    /// `Some(multi_db)` when the connection's upstream template is ready.
    pub upstream: Option<bool>,
}

/// Builds the reply of `INFO [section ...]`. Rendering reads process wide
/// counters, so it runs off the dispatch path.
pub fn info_command(context: InfoContext, command: &Command) -> BoxFuture<'static, RespValue> {
    let sections: Vec<String> = command.parts()[1..]
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).trim().to_ascii_lowercase())
        .filter(|section| !section.is_empty())
        .collect();
    async move { RespValue::BulkString(render_info(&context, &sections)) }.boxed()
}

pub fn render_info(context: &InfoContext, filter: &[String]) -> Bytes {
    let uptime = SystemTime::now()
        .duration_since(*START_TIME)
        .unwrap_or_default();
    let uptime_seconds = uptime.as_secs();
    let startup_time_unix = START_TIME
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut output = String::new();
    for (name, entries) in collect_sections(context, uptime_seconds, startup_time_unix) {
        if !should_include(filter, name) {
            continue;
        }
        if !output.is_empty() {
            output.push_str("\r\n");
        }
        output.push_str("# ");
        output.push_str(name);
        output.push_str("\r\n");
        for (key, value) in entries {
            output.push_str(key);
            output.push(':');
            output.push_str(&value);
            output.push_str("\r\n");
        }
    }

    if output.is_empty() {
        output.push_str("\r\n");
    }

    Bytes::from(output)
}

fn collect_sections(
    context: &InfoContext,
    uptime_seconds: u64,
    startup_time_unix: u64,
) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
    let results = metrics::command_results();
    let result = |label: &str| results.get(label).copied().unwrap_or(0);
    let processed: u64 = results.values().sum();

    vec![
        (
            "Server",
            vec![
                ("transponder_version", env!("CARGO_PKG_VERSION").to_string()),
                ("process_id", std::process::id().to_string()),
                ("arch_bits", (std::mem::size_of::<usize>() * 8).to_string()),
                ("os", std::env::consts::OS.to_string()),
                ("startup_time_unix", startup_time_unix.to_string()),
                ("uptime_in_seconds", uptime_seconds.to_string()),
                ("uptime_in_days", (uptime_seconds / 86_400).to_string()),
            ],
        ),
        (
            "Clients",
            vec![(
                "tenant_connections",
                metrics::tenant_connections_total().to_string(),
            )],
        ),
        (
            "Stats",
            vec![
                ("total_commands_processed", processed.to_string()),
                ("total_commands_upstream", result("upstream").to_string()),
                ("total_commands_local", result("local").to_string()),
                ("total_commands_rejected", result("rejected").to_string()),
                ("total_commands_plugin", result("plugin").to_string()),
                ("proxy_errors", metrics::error_total().to_string()),
            ],
        ),
        (
            "Connection",
            vec![
                ("id", context.consid.to_string()),
                ("db", context.db.to_string()),
                (
                    "tenant",
                    context
                        .tenant
                        .as_ref()
                        .map(Tenant::to_string)
                        .unwrap_or_default(),
                ),
                ("name", context.client_name.clone().unwrap_or_default()),
            ],
        ),
        (
            "Upstream",
            vec![
                ("cluster_mode", yes_no(context.cluster_mode)),
                ("multi_tenants", yes_no(context.multi_tenants)),
                (
                    "template",
                    if context.upstream.is_some() {
                        "ready"
                    } else {
                        "pending"
                    }
                    .to_string(),
                ),
                ("multi_db", yes_no(context.upstream.unwrap_or(false))),
            ],
        ),
    ]
}

fn yes_no(value: bool) -> String {
    let text = if value { "yes" } else { "no" };
    text.to_string()
}

fn should_include(filter: &[String], section: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    filter.iter().any(|candidate| {
        matches!(candidate.as_str(), "all" | "default" | "everything")
            || candidate.eq_ignore_ascii_case(section)
    })
}
