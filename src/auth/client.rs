//! `CLIENT` subcommands answered by the proxy itself.
//!
//! A client name of the form `tenant_<bid>_<bgroup>` selects the tenant of a
//! connection that has none yet, so SDKs without AUTH-based routing can
//! still reach a dedicated upstream.

use bytes::Bytes;

use crate::protocol::redis::{reply, Command, RespValue};
use crate::session::ChannelInfo;
use crate::upstream::Tenant;

const TENANT_NAME_PREFIX: &str = "tenant_";

pub fn invoke_client_command(channel: &mut ChannelInfo, command: &Command) -> RespValue {
    let parts = command.parts();
    let Some(sub) = parts.get(1) else {
        return reply::wrong_number_of_args("client");
    };
    if sub.eq_ignore_ascii_case(b"SETNAME") {
        if parts.len() != 3 {
            return reply::wrong_number_of_args("client|setname");
        }
        set_name(channel, &parts[2])
    } else if sub.eq_ignore_ascii_case(b"GETNAME") {
        match channel.client_name() {
            Some(name) => RespValue::BulkString(name.clone()),
            None => RespValue::NullBulk,
        }
    } else if sub.eq_ignore_ascii_case(b"ID") {
        RespValue::Integer(channel.consid() as i64)
    } else {
        reply::not_support()
    }
}

fn set_name(channel: &mut ChannelInfo, name: &Bytes) -> RespValue {
    if name.iter().any(|b| *b <= b' ' || *b > b'~') {
        return RespValue::error(
            "ERR Client names cannot contain spaces, newlines or special characters.",
        );
    }
    if channel.tenant().is_none() {
        if let Some(tenant) = parse_tenant_name(name) {
            channel.set_tenant(Some(tenant));
        }
    }
    channel.set_client_name(if name.is_empty() {
        None
    } else {
        Some(name.clone())
    });
    reply::ok()
}

fn parse_tenant_name(name: &[u8]) -> Option<Tenant> {
    let name = std::str::from_utf8(name).ok()?;
    let rest = name.strip_prefix(TENANT_NAME_PREFIX)?;
    let (bid, bgroup) = rest.split_once('_')?;
    let tenant = Tenant::new(bid.parse().ok()?, bgroup);
    tenant.is_routable().then_some(tenant)
}
