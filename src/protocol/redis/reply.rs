//! Canonical replies the proxy produces on its own.
//!
//! Error strings are stable: clients and monitoring match on them.

use bytes::Bytes;

use super::types::RespValue;

pub fn ok() -> RespValue {
    RespValue::SimpleString(Bytes::from_static(b"OK"))
}

pub fn pong() -> RespValue {
    RespValue::SimpleString(Bytes::from_static(b"PONG"))
}

pub fn not_support() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR command not support"))
}

pub fn no_auth() -> RespValue {
    RespValue::Error(Bytes::from_static(b"NOAUTH Authentication required."))
}

pub fn too_busy() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR proxy too busy"))
}

pub fn too_many_connects() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR too many connects"))
}

pub fn db_index_out_of_range() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR DB index is out of range"))
}

pub fn upstream_not_available() -> RespValue {
    RespValue::Error(Bytes::from_static(b"ERR upstream not available"))
}

pub fn not_integer() -> RespValue {
    RespValue::Error(Bytes::from_static(
        b"ERR value is not an integer or out of range",
    ))
}

pub fn wrong_number_of_args(command: &str) -> RespValue {
    RespValue::Error(Bytes::from(format!(
        "ERR wrong number of arguments for '{}' command",
        command.to_ascii_lowercase()
    )))
}

pub fn not_allowed_while_subscribed(command: &str) -> RespValue {
    RespValue::Error(Bytes::from(format!(
        "ERR Command {} not allowed while subscribed. Allowed commands are: [PSUBSCRIBE, PUNSUBSCRIBE, SUBSCRIBE, UNSUBSCRIBE, QUIT, PING]",
        command.to_ascii_uppercase()
    )))
}
