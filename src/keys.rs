//! Routing key extraction.
//!
//! Multi-key commands disagree wildly on where their keys live, so the
//! extraction is table driven per command rather than generic.

use bytes::Bytes;
use tracing::warn;

use crate::protocol::redis::{Command, CommandKeyType, RedisCommand};
use crate::utils::parse_i64;

/// Returns the routing keys of `command` in argument order. Unknown and
/// keyless commands yield an empty list; malformed arguments yield a partial
/// or empty list, never an error.
pub fn find_keys(command: &Command) -> Vec<Bytes> {
    let Some(redis_command) = command.redis_command() else {
        return Vec::new();
    };
    let parts = command.parts();
    match redis_command.key_type() {
        CommandKeyType::None => Vec::new(),
        CommandKeyType::SimpleSingle => parts.get(1).cloned().into_iter().collect(),
        CommandKeyType::SimpleMulti => parts.iter().skip(1).cloned().collect(),
        CommandKeyType::Complex => complex_keys(redis_command, parts),
    }
}

fn complex_keys(redis_command: RedisCommand, parts: &[Bytes]) -> Vec<Bytes> {
    let mut keys = Vec::new();
    match redis_command {
        RedisCommand::Mset | RedisCommand::Msetnx => {
            keys.extend(parts.iter().skip(1).step_by(2).cloned());
        }
        RedisCommand::Eval | RedisCommand::Evalsha => eval_keys(parts, &mut keys),
        RedisCommand::Smove => {
            if parts.len() >= 3 {
                push_range(parts, &mut keys, 1, 2);
            }
        }
        RedisCommand::Zinterstore | RedisCommand::Zunionstore => {
            if parts.len() >= 4 {
                let count = parse_i64(&parts[2]).unwrap_or(0);
                if count > 0 && parts.len() as i64 >= 3 + count {
                    keys.push(parts[1].clone());
                    push_range(parts, &mut keys, 3, 2 + count as usize);
                }
            }
        }
        RedisCommand::Bitop => {
            if parts.len() >= 4 {
                push_range(parts, &mut keys, 2, parts.len() - 1);
            }
        }
        RedisCommand::Blpop | RedisCommand::Brpop | RedisCommand::Brpoplpush => {
            if parts.len() >= 3 {
                push_range(parts, &mut keys, 1, parts.len() - 2);
            }
            // blocking pops also get the stream scan below
            stream_keys(parts, &mut keys);
        }
        RedisCommand::Xread | RedisCommand::Xreadgroup => stream_keys(parts, &mut keys),
        other => {
            warn!(command = other.name(), "unknown keys");
        }
    }
    keys
}

/// `EVAL script numkeys key [key ...] arg [arg ...]`
fn eval_keys(parts: &[Bytes], keys: &mut Vec<Bytes>) {
    let Some(count) = parts.get(2).and_then(|raw| parse_i64(raw)) else {
        return;
    };
    if count <= 0 || (parts.len() as i64) < 3 + count {
        return;
    }
    push_range(parts, keys, 3, 2 + count as usize);
}

/// Keys are the first half of the arguments after the `STREAMS` token.
fn stream_keys(parts: &[Bytes], keys: &mut Vec<Bytes>) {
    let Some(index) = parts
        .iter()
        .skip(1)
        .position(|part| part.eq_ignore_ascii_case(b"STREAMS"))
        .map(|pos| pos + 1)
    else {
        return;
    };
    let remaining = parts.len() - index - 1;
    if remaining == 0 || remaining % 2 != 0 {
        return;
    }
    push_range(parts, keys, index + 1, index + remaining / 2);
}

/// Pushes `parts[start..=end]`, clamped to the available arguments.
fn push_range(parts: &[Bytes], keys: &mut Vec<Bytes>, start: usize, end: usize) {
    if start > end || start >= parts.len() {
        return;
    }
    let end = end.min(parts.len() - 1);
    keys.extend(parts[start..=end].iter().cloned());
}
