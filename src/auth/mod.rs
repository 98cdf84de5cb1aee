mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::protocol::redis::{reply, Command, RespCodec, RespValue};
use crate::session::{ChannelInfo, ChannelStats};
use crate::upstream::Tenant;
use crate::utils::parse_i64;

pub use client::invoke_client_command;

/// Redis 默认用户名。
pub const DEFAULT_USER: &str = "default";

/// 前端认证配置，兼容旧版简单密码写法。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FrontendAuthConfig {
    /// 旧版 `password = "xxx"` 样式。
    Password(String),
    /// 用户表，可为每个用户绑定租户。
    Detailed(FrontendAuthTable),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendAuthTable {
    /// 简化写法：纯密码等价于 default 用户。
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub users: Vec<AuthUserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUserConfig {
    pub username: String,
    pub password: String,
    /// 认证成功后绑定到连接上的租户。
    #[serde(default)]
    pub tenant: Option<Tenant>,
}

impl FrontendAuthConfig {
    pub fn into_users(self) -> Vec<AuthUserConfig> {
        match self {
            FrontendAuthConfig::Password(password) => vec![AuthUserConfig {
                username: DEFAULT_USER.to_string(),
                password,
                tenant: None,
            }],
            FrontendAuthConfig::Detailed(table) => {
                let mut users = Vec::new();
                if let Some(password) = table.password {
                    users.push(AuthUserConfig {
                        username: DEFAULT_USER.to_string(),
                        password,
                        tenant: None,
                    });
                }
                users.extend(table.users);
                users
            }
        }
    }
}

/// 后端认证配置，支持 ACL 写法与旧式密码。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendAuthConfig {
    Password(String),
    Credential { username: String, password: String },
}

/// AUTH issued on every new upstream or sentinel connection.
#[derive(Debug, Clone)]
pub struct BackendAuth {
    parts: Arc<[Bytes]>,
}

impl BackendAuth {
    pub fn from_password(password: String) -> Self {
        let parts = vec![Bytes::from_static(b"AUTH"), Bytes::from(password)];
        Self {
            parts: parts.into(),
        }
    }

    pub fn from_credential(username: String, password: String) -> Self {
        let parts = vec![
            Bytes::from_static(b"AUTH"),
            Bytes::from(username),
            Bytes::from(password),
        ];
        Self {
            parts: parts.into(),
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::new(self.parts.to_vec())
    }

    pub async fn apply_to_stream(
        &self,
        framed: &mut Framed<TcpStream, RespCodec>,
        timeout_duration: Duration,
        target: &str,
    ) -> Result<()> {
        let command = self.command()?;
        timeout(timeout_duration, framed.send(command))
            .await
            .with_context(|| format!("timed out sending AUTH to {}", target))??;

        let response = timeout(timeout_duration, framed.next())
            .await
            .with_context(|| format!("timed out waiting for AUTH reply from {}", target))?
            .ok_or_else(|| anyhow!("{} closed connection during AUTH", target))?;

        match response? {
            RespValue::SimpleString(ref data) | RespValue::BulkString(ref data)
                if data.eq_ignore_ascii_case(b"OK") =>
            {
                Ok(())
            }
            RespValue::Error(err) => Err(anyhow!(
                "{} rejected AUTH: {}",
                target,
                String::from_utf8_lossy(&err)
            )),
            other => Err(anyhow!(
                "unexpected response for {} AUTH: {:?}",
                target,
                other
            )),
        }
    }
}

impl From<BackendAuthConfig> for BackendAuth {
    fn from(value: BackendAuthConfig) -> Self {
        match value {
            BackendAuthConfig::Password(password) => BackendAuth::from_password(password),
            BackendAuthConfig::Credential { username, password } => {
                BackendAuth::from_credential(username, password)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct AuthUser {
    secret: Arc<[u8]>,
    tenant: Option<Tenant>,
}

impl From<AuthUserConfig> for AuthUser {
    fn from(value: AuthUserConfig) -> Self {
        Self {
            secret: Arc::from(value.password.into_bytes()),
            tenant: value.tenant,
        }
    }
}

/// Client-side AUTH and HELLO handling. Holds the configured users; the
/// per-connection outcome is written into [`ChannelInfo`].
#[derive(Debug, Clone, Default)]
pub struct AuthCommandProcessor {
    users: Arc<HashMap<String, AuthUser>>,
}

impl AuthCommandProcessor {
    /// A processor with no password configured: every connection is
    /// implicitly authenticated.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(config: Option<FrontendAuthConfig>) -> Result<Self> {
        match config {
            Some(config) => Self::from_users(config.into_users()),
            None => Ok(Self::disabled()),
        }
    }

    pub fn from_users(users: Vec<AuthUserConfig>) -> Result<Self> {
        if users.is_empty() {
            bail!("auth configuration must declare at least one user");
        }
        let mut map = HashMap::new();
        for user_cfg in users.into_iter() {
            let username = user_cfg.username.clone();
            let user = AuthUser::from(user_cfg);
            if map.insert(username.clone(), user).is_some() {
                bail!("duplicate user '{}' in auth configuration", username);
            }
        }
        Ok(Self {
            users: Arc::new(map),
        })
    }

    pub fn is_password_required(&self) -> bool {
        !self.users.is_empty()
    }

    /// `AUTH password` or `AUTH username password`.
    pub fn invoke_auth_command(&self, channel: &mut ChannelInfo, command: &Command) -> RespValue {
        let parts = command.parts();
        if !self.is_password_required() {
            return RespValue::error(
                "ERR AUTH <password> called without any password configured for the default user. Are you sure your configuration is correct?",
            );
        }
        match parts.len() {
            2 => self.authenticate(channel, DEFAULT_USER.as_bytes(), &parts[1]),
            3 => self.authenticate(channel, &parts[1], &parts[2]),
            _ => reply::wrong_number_of_args("auth"),
        }
    }

    /// `HELLO [protover [AUTH username password] [SETNAME clientname]]`.
    /// Only protocol version 2 is spoken.
    pub fn invoke_hello_command(&self, channel: &mut ChannelInfo, command: &Command) -> RespValue {
        let parts = command.parts();
        if let Some(version) = parts.get(1) {
            match parse_i64(version) {
                Some(2) => {}
                Some(_) => {
                    return RespValue::error("NOPROTO sorry, this protocol version is not supported")
                }
                None => {
                    return RespValue::error("ERR Protocol version is not an integer or out of range")
                }
            }
        }

        let mut client_name = None;
        let mut index = 2;
        while index < parts.len() {
            let remaining = parts.len() - index - 1;
            if parts[index].eq_ignore_ascii_case(b"AUTH") && remaining >= 2 {
                if !self.is_password_required() {
                    return RespValue::error(
                        "ERR AUTH <password> called without any password configured for the default user. Are you sure your configuration is correct?",
                    );
                }
                let result = self.authenticate(channel, &parts[index + 1], &parts[index + 2]);
                if result.is_error() {
                    return result;
                }
                index += 3;
            } else if parts[index].eq_ignore_ascii_case(b"SETNAME") && remaining >= 1 {
                client_name = Some(parts[index + 1].clone());
                index += 2;
            } else {
                return RespValue::Error(Bytes::from(format!(
                    "ERR Syntax error in HELLO option '{}'",
                    String::from_utf8_lossy(&parts[index])
                )));
            }
        }

        if self.is_password_required() && channel.channel_stats() != ChannelStats::AuthOk {
            return RespValue::error(
                "NOAUTH HELLO must be called with the client already authenticated, otherwise the HELLO AUTH <user> <pass> option can be used to authenticate the client and select the RESP protocol version at the same time",
            );
        }
        if client_name.is_some() {
            channel.set_client_name(client_name);
        }
        hello_reply(channel)
    }

    fn authenticate(&self, channel: &mut ChannelInfo, username: &[u8], password: &[u8]) -> RespValue {
        let user = std::str::from_utf8(username)
            .ok()
            .and_then(|name| self.users.get(name).map(|user| (name, user)));
        match user {
            Some((name, user)) if user.secret.as_ref() == password => {
                channel.set_channel_stats(ChannelStats::AuthOk);
                channel.set_user(Some(name.to_string()));
                if channel.tenant().is_none() {
                    if let Some(tenant) = &user.tenant {
                        channel.set_tenant(Some(tenant.clone()));
                    }
                }
                reply::ok()
            }
            _ => {
                channel.set_channel_stats(ChannelStats::NoAuth);
                RespValue::error("WRONGPASS invalid username-password pair or user is disabled.")
            }
        }
    }
}

fn hello_reply(channel: &ChannelInfo) -> RespValue {
    RespValue::Array(vec![
        RespValue::bulk("server"),
        RespValue::bulk("redis"),
        RespValue::bulk("version"),
        RespValue::bulk(env!("CARGO_PKG_VERSION")),
        RespValue::bulk("proto"),
        RespValue::Integer(2),
        RespValue::bulk("id"),
        RespValue::Integer(channel.consid() as i64),
        RespValue::bulk("mode"),
        RespValue::bulk("proxy"),
        RespValue::bulk("role"),
        RespValue::bulk("master"),
        RespValue::bulk("modules"),
        RespValue::Array(Vec::new()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelTransport;

    fn channel() -> ChannelInfo {
        let (transport, _rx) = ChannelTransport::new(None);
        ChannelInfo::new(transport, 16)
    }

    fn processor() -> AuthCommandProcessor {
        AuthCommandProcessor::from_users(vec![
            AuthUserConfig {
                username: DEFAULT_USER.to_string(),
                password: "secret".to_string(),
                tenant: None,
            },
            AuthUserConfig {
                username: "biz".to_string(),
                password: "biz-secret".to_string(),
                tenant: Some(Tenant::new(7, "default")),
            },
        ])
        .expect("auth")
    }

    #[test]
    fn password_shorthand_maps_to_default_user() {
        let users = FrontendAuthConfig::Password("pw".into()).into_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, DEFAULT_USER);
        assert!(!AuthCommandProcessor::from_config(None)
            .unwrap()
            .is_password_required());
    }

    #[test]
    fn auth_with_default_password() {
        let auth = processor();
        let mut channel = channel();
        let reply = auth.invoke_auth_command(&mut channel, &Command::from_parts(["AUTH", "secret"]));
        assert_eq!(reply, reply::ok());
        assert_eq!(channel.channel_stats(), ChannelStats::AuthOk);
        assert!(channel.tenant().is_none());
    }

    #[test]
    fn auth_with_user_binds_tenant() {
        let auth = processor();
        let mut channel = channel();
        let reply = auth.invoke_auth_command(
            &mut channel,
            &Command::from_parts(["AUTH", "biz", "biz-secret"]),
        );
        assert_eq!(reply, reply::ok());
        assert_eq!(channel.tenant(), Some(&Tenant::new(7, "default")));
        assert_eq!(channel.user(), Some("biz"));
    }

    #[test]
    fn wrong_password_resets_auth_state() {
        let auth = processor();
        let mut channel = channel();
        auth.invoke_auth_command(&mut channel, &Command::from_parts(["AUTH", "secret"]));
        let reply = auth.invoke_auth_command(&mut channel, &Command::from_parts(["AUTH", "nope"]));
        assert!(reply.is_error());
        assert_eq!(channel.channel_stats(), ChannelStats::NoAuth);

        let reply = auth.invoke_auth_command(&mut channel, &Command::from_parts(["AUTH"]));
        assert_eq!(reply, reply::wrong_number_of_args("auth"));
    }

    #[test]
    fn auth_without_configured_password_errors() {
        let auth = AuthCommandProcessor::disabled();
        let mut channel = channel();
        let reply = auth.invoke_auth_command(&mut channel, &Command::from_parts(["AUTH", "x"]));
        assert!(reply.is_error());
        assert!(!auth.is_password_required());
    }

    #[test]
    fn hello_authenticates_and_names_client() {
        let auth = processor();
        let mut channel = channel();
        let reply = auth.invoke_hello_command(
            &mut channel,
            &Command::from_parts(["HELLO", "2", "AUTH", "default", "secret", "SETNAME", "app"]),
        );
        assert!(!reply.is_error(), "{:?}", reply);
        assert_eq!(channel.channel_stats(), ChannelStats::AuthOk);
        assert_eq!(channel.client_name().map(|b| b.as_ref()), Some(&b"app"[..]));
    }

    #[test]
    fn hello_rejects_resp3_and_unauthenticated() {
        let auth = processor();
        let mut channel = channel();
        let reply = auth.invoke_hello_command(&mut channel, &Command::from_parts(["HELLO", "3"]));
        assert!(matches!(reply, RespValue::Error(ref e) if e.starts_with(b"NOPROTO")));

        let reply = auth.invoke_hello_command(&mut channel, &Command::from_parts(["HELLO", "2"]));
        assert!(matches!(reply, RespValue::Error(ref e) if e.starts_with(b"NOAUTH")));

        let open = AuthCommandProcessor::disabled();
        let reply = open.invoke_hello_command(&mut channel, &Command::from_parts(["HELLO"]));
        assert!(reply.as_array().is_some());
    }
}
