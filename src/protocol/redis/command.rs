use std::fmt;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;

use crate::backend::client::ClientId;

use super::catalog::RedisCommand;
use super::types::RespValue;

pub const SLOT_COUNT: u16 = 16384;

/// One parsed client request. Part 0 is the command name.
#[derive(Clone)]
pub struct Command {
    parts: Vec<Bytes>,
    redis_command: Option<RedisCommand>,
    client: Option<ClientId>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field(
                "parts",
                &self
                    .parts
                    .iter()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .collect::<Vec<_>>(),
            )
            .field("client", &self.client)
            .finish()
    }
}

impl Command {
    pub fn new(parts: Vec<Bytes>) -> Result<Self> {
        let Some(name) = parts.first() else {
            bail!("redis command must contain at least one element");
        };
        let redis_command = RedisCommand::from_name(name);
        Ok(Self {
            parts,
            redis_command,
            client: None,
        })
    }

    /// Convenience constructor for literal arguments. Panics on an empty list.
    pub fn from_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let parts: Vec<Bytes> = parts
            .into_iter()
            .map(|p| Bytes::copy_from_slice(p.as_ref()))
            .collect();
        Self::new(parts).expect("command literal must not be empty")
    }

    pub fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                            parts.push(data)
                        }
                        RespValue::Integer(int) => {
                            parts.push(Bytes::copy_from_slice(int.to_string().as_bytes()))
                        }
                        RespValue::NullBulk | RespValue::NullArray => {
                            bail!("command argument cannot be null");
                        }
                        RespValue::Error(err) => {
                            bail!(
                                "client sent RESP error frame as command argument: {}",
                                String::from_utf8_lossy(&err)
                            );
                        }
                        RespValue::Array(_) => {
                            bail!("nested array arguments are not supported");
                        }
                    }
                }
                Self::new(parts)
            }
            other => Err(anyhow!(
                "redis command must be an array frame, received {:?}",
                other
            )),
        }
    }

    pub fn to_resp(&self) -> RespValue {
        RespValue::Array(
            self.parts
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }

    pub fn name(&self) -> &[u8] {
        self.parts.first().map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// Name for logs and metric labels.
    pub fn name_lossy(&self) -> String {
        match self.redis_command {
            Some(command) => command.name().to_string(),
            None => String::from_utf8_lossy(self.name()).to_ascii_uppercase(),
        }
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.parts.get(index)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn redis_command(&self) -> Option<RedisCommand> {
        self.redis_command
    }

    /// Binds the command to the connection that sent it.
    pub fn bind_client(&mut self, client: ClientId) {
        self.client = Some(client);
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client
    }

    /// Case-insensitive comparison of the argument at `index`.
    pub fn arg_eq_ignore_case(&self, index: usize, expected: &[u8]) -> bool {
        self.parts
            .get(index)
            .map(|arg| arg.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).to_string())
            .collect();
        write!(f, "{}", args.join(" "))
    }
}
