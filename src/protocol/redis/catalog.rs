//! Static command catalog: one descriptor per command name the proxy knows.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportType {
    Support,
    NotSupport,
}

/// `Db` commands act on the client session and are handled by the
/// dispatcher itself; `Normal` commands are forwarded upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Normal,
    Db,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKeyType {
    None,
    SimpleSingle,
    SimpleMulti,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
    Other,
}

macro_rules! redis_commands {
    ($($variant:ident => $name:literal, $support:ident, $ctype:ident, $key:ident, $kind:ident;)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RedisCommand {
            $($variant,)+
        }

        impl RedisCommand {
            pub const ALL: &'static [RedisCommand] = &[$(RedisCommand::$variant,)+];

            pub fn name(self) -> &'static str {
                match self {
                    $(RedisCommand::$variant => $name,)+
                }
            }

            pub fn support_type(self) -> SupportType {
                match self {
                    $(RedisCommand::$variant => SupportType::$support,)+
                }
            }

            pub fn command_type(self) -> CommandType {
                match self {
                    $(RedisCommand::$variant => CommandType::$ctype,)+
                }
            }

            pub fn key_type(self) -> CommandKeyType {
                match self {
                    $(RedisCommand::$variant => CommandKeyType::$key,)+
                }
            }

            pub fn kind(self) -> CommandKind {
                match self {
                    $(RedisCommand::$variant => CommandKind::$kind,)+
                }
            }
        }
    };
}

redis_commands! {
    // session control
    Ping => "PING", Support, Db, None, Other;
    Auth => "AUTH", Support, Db, None, Other;
    Hello => "HELLO", Support, Db, None, Other;
    Quit => "QUIT", Support, Db, None, Other;
    Select => "SELECT", Support, Db, None, Other;
    Info => "INFO", Support, Db, None, Other;
    Client => "CLIENT", Support, Db, None, Other;
    Asking => "ASKING", Support, Db, None, Other;
    Config => "CONFIG", Support, Db, None, Other;
    Cluster => "CLUSTER", Support, Db, None, Other;
    Echo => "ECHO", Support, Normal, None, Other;
    Time => "TIME", Support, Normal, None, Other;
    Dbsize => "DBSIZE", Support, Normal, None, Read;

    // keys
    Del => "DEL", Support, Normal, SimpleMulti, Write;
    Unlink => "UNLINK", Support, Normal, SimpleMulti, Write;
    Exists => "EXISTS", Support, Normal, SimpleMulti, Read;
    Touch => "TOUCH", Support, Normal, SimpleMulti, Read;
    Expire => "EXPIRE", Support, Normal, SimpleSingle, Write;
    Pexpire => "PEXPIRE", Support, Normal, SimpleSingle, Write;
    Expireat => "EXPIREAT", Support, Normal, SimpleSingle, Write;
    Pexpireat => "PEXPIREAT", Support, Normal, SimpleSingle, Write;
    Expiretime => "EXPIRETIME", Support, Normal, SimpleSingle, Read;
    Persist => "PERSIST", Support, Normal, SimpleSingle, Write;
    Ttl => "TTL", Support, Normal, SimpleSingle, Read;
    Pttl => "PTTL", Support, Normal, SimpleSingle, Read;
    Type => "TYPE", Support, Normal, SimpleSingle, Read;
    Dump => "DUMP", Support, Normal, SimpleSingle, Read;
    Restore => "RESTORE", Support, Normal, SimpleSingle, Write;
    Rename => "RENAME", Support, Normal, SimpleMulti, Write;
    Renamenx => "RENAMENX", Support, Normal, SimpleMulti, Write;
    Sort => "SORT", Support, Normal, SimpleSingle, Write;
    Keys => "KEYS", NotSupport, Normal, None, Read;
    Scan => "SCAN", NotSupport, Normal, None, Read;
    Randomkey => "RANDOMKEY", NotSupport, Normal, None, Read;
    Move => "MOVE", NotSupport, Normal, SimpleSingle, Write;
    Migrate => "MIGRATE", NotSupport, Normal, None, Write;
    Object => "OBJECT", NotSupport, Normal, None, Read;
    Swapdb => "SWAPDB", NotSupport, Normal, None, Write;

    // strings
    Get => "GET", Support, Normal, SimpleSingle, Read;
    Set => "SET", Support, Normal, SimpleSingle, Write;
    Setnx => "SETNX", Support, Normal, SimpleSingle, Write;
    Setex => "SETEX", Support, Normal, SimpleSingle, Write;
    Psetex => "PSETEX", Support, Normal, SimpleSingle, Write;
    Getset => "GETSET", Support, Normal, SimpleSingle, Write;
    Getdel => "GETDEL", Support, Normal, SimpleSingle, Write;
    Getex => "GETEX", Support, Normal, SimpleSingle, Write;
    Getrange => "GETRANGE", Support, Normal, SimpleSingle, Read;
    Substr => "SUBSTR", Support, Normal, SimpleSingle, Read;
    Setrange => "SETRANGE", Support, Normal, SimpleSingle, Write;
    Strlen => "STRLEN", Support, Normal, SimpleSingle, Read;
    Append => "APPEND", Support, Normal, SimpleSingle, Write;
    Incr => "INCR", Support, Normal, SimpleSingle, Write;
    Incrby => "INCRBY", Support, Normal, SimpleSingle, Write;
    Incrbyfloat => "INCRBYFLOAT", Support, Normal, SimpleSingle, Write;
    Decr => "DECR", Support, Normal, SimpleSingle, Write;
    Decrby => "DECRBY", Support, Normal, SimpleSingle, Write;
    Mget => "MGET", Support, Normal, SimpleMulti, Read;
    Mset => "MSET", Support, Normal, Complex, Write;
    Msetnx => "MSETNX", Support, Normal, Complex, Write;
    Setbit => "SETBIT", Support, Normal, SimpleSingle, Write;
    Getbit => "GETBIT", Support, Normal, SimpleSingle, Read;
    Bitcount => "BITCOUNT", Support, Normal, SimpleSingle, Read;
    Bitpos => "BITPOS", Support, Normal, SimpleSingle, Read;
    Bitfield => "BITFIELD", Support, Normal, SimpleSingle, Write;
    Bitop => "BITOP", Support, Normal, Complex, Write;
    Pfadd => "PFADD", Support, Normal, SimpleSingle, Write;
    Pfcount => "PFCOUNT", Support, Normal, SimpleMulti, Read;
    Pfmerge => "PFMERGE", Support, Normal, SimpleMulti, Write;

    // hashes
    Hget => "HGET", Support, Normal, SimpleSingle, Read;
    Hset => "HSET", Support, Normal, SimpleSingle, Write;
    Hsetnx => "HSETNX", Support, Normal, SimpleSingle, Write;
    Hmget => "HMGET", Support, Normal, SimpleSingle, Read;
    Hmset => "HMSET", Support, Normal, SimpleSingle, Write;
    Hdel => "HDEL", Support, Normal, SimpleSingle, Write;
    Hexists => "HEXISTS", Support, Normal, SimpleSingle, Read;
    Hgetall => "HGETALL", Support, Normal, SimpleSingle, Read;
    Hkeys => "HKEYS", Support, Normal, SimpleSingle, Read;
    Hvals => "HVALS", Support, Normal, SimpleSingle, Read;
    Hlen => "HLEN", Support, Normal, SimpleSingle, Read;
    Hstrlen => "HSTRLEN", Support, Normal, SimpleSingle, Read;
    Hincrby => "HINCRBY", Support, Normal, SimpleSingle, Write;
    Hincrbyfloat => "HINCRBYFLOAT", Support, Normal, SimpleSingle, Write;
    Hscan => "HSCAN", Support, Normal, SimpleSingle, Read;
    Hrandfield => "HRANDFIELD", Support, Normal, SimpleSingle, Read;

    // lists
    Lpush => "LPUSH", Support, Normal, SimpleSingle, Write;
    Rpush => "RPUSH", Support, Normal, SimpleSingle, Write;
    Lpushx => "LPUSHX", Support, Normal, SimpleSingle, Write;
    Rpushx => "RPUSHX", Support, Normal, SimpleSingle, Write;
    Lpop => "LPOP", Support, Normal, SimpleSingle, Write;
    Rpop => "RPOP", Support, Normal, SimpleSingle, Write;
    Llen => "LLEN", Support, Normal, SimpleSingle, Read;
    Lindex => "LINDEX", Support, Normal, SimpleSingle, Read;
    Lrange => "LRANGE", Support, Normal, SimpleSingle, Read;
    Lset => "LSET", Support, Normal, SimpleSingle, Write;
    Lrem => "LREM", Support, Normal, SimpleSingle, Write;
    Ltrim => "LTRIM", Support, Normal, SimpleSingle, Write;
    Linsert => "LINSERT", Support, Normal, SimpleSingle, Write;
    Lpos => "LPOS", Support, Normal, SimpleSingle, Read;
    Rpoplpush => "RPOPLPUSH", Support, Normal, SimpleMulti, Write;
    Lmove => "LMOVE", Support, Normal, SimpleMulti, Write;
    Blpop => "BLPOP", Support, Normal, Complex, Write;
    Brpop => "BRPOP", Support, Normal, Complex, Write;
    Brpoplpush => "BRPOPLPUSH", Support, Normal, Complex, Write;
    Lmpop => "LMPOP", Support, Normal, Complex, Write;

    // sets
    Sadd => "SADD", Support, Normal, SimpleSingle, Write;
    Srem => "SREM", Support, Normal, SimpleSingle, Write;
    Scard => "SCARD", Support, Normal, SimpleSingle, Read;
    Smembers => "SMEMBERS", Support, Normal, SimpleSingle, Read;
    Sismember => "SISMEMBER", Support, Normal, SimpleSingle, Read;
    Smismember => "SMISMEMBER", Support, Normal, SimpleSingle, Read;
    Spop => "SPOP", Support, Normal, SimpleSingle, Write;
    Srandmember => "SRANDMEMBER", Support, Normal, SimpleSingle, Read;
    Sscan => "SSCAN", Support, Normal, SimpleSingle, Read;
    Smove => "SMOVE", Support, Normal, Complex, Write;
    Sinter => "SINTER", Support, Normal, SimpleMulti, Read;
    Sunion => "SUNION", Support, Normal, SimpleMulti, Read;
    Sdiff => "SDIFF", Support, Normal, SimpleMulti, Read;
    Sinterstore => "SINTERSTORE", Support, Normal, SimpleMulti, Write;
    Sunionstore => "SUNIONSTORE", Support, Normal, SimpleMulti, Write;
    Sdiffstore => "SDIFFSTORE", Support, Normal, SimpleMulti, Write;
    Sintercard => "SINTERCARD", Support, Normal, Complex, Read;

    // sorted sets
    Zadd => "ZADD", Support, Normal, SimpleSingle, Write;
    Zrem => "ZREM", Support, Normal, SimpleSingle, Write;
    Zcard => "ZCARD", Support, Normal, SimpleSingle, Read;
    Zcount => "ZCOUNT", Support, Normal, SimpleSingle, Read;
    Zlexcount => "ZLEXCOUNT", Support, Normal, SimpleSingle, Read;
    Zincrby => "ZINCRBY", Support, Normal, SimpleSingle, Write;
    Zscore => "ZSCORE", Support, Normal, SimpleSingle, Read;
    Zmscore => "ZMSCORE", Support, Normal, SimpleSingle, Read;
    Zrank => "ZRANK", Support, Normal, SimpleSingle, Read;
    Zrevrank => "ZREVRANK", Support, Normal, SimpleSingle, Read;
    Zrange => "ZRANGE", Support, Normal, SimpleSingle, Read;
    Zrevrange => "ZREVRANGE", Support, Normal, SimpleSingle, Read;
    Zrangebyscore => "ZRANGEBYSCORE", Support, Normal, SimpleSingle, Read;
    Zrevrangebyscore => "ZREVRANGEBYSCORE", Support, Normal, SimpleSingle, Read;
    Zrangebylex => "ZRANGEBYLEX", Support, Normal, SimpleSingle, Read;
    Zrevrangebylex => "ZREVRANGEBYLEX", Support, Normal, SimpleSingle, Read;
    Zremrangebyrank => "ZREMRANGEBYRANK", Support, Normal, SimpleSingle, Write;
    Zremrangebyscore => "ZREMRANGEBYSCORE", Support, Normal, SimpleSingle, Write;
    Zremrangebylex => "ZREMRANGEBYLEX", Support, Normal, SimpleSingle, Write;
    Zpopmin => "ZPOPMIN", Support, Normal, SimpleSingle, Write;
    Zpopmax => "ZPOPMAX", Support, Normal, SimpleSingle, Write;
    Zscan => "ZSCAN", Support, Normal, SimpleSingle, Read;
    Zrandmember => "ZRANDMEMBER", Support, Normal, SimpleSingle, Read;
    Zinterstore => "ZINTERSTORE", Support, Normal, Complex, Write;
    Zunionstore => "ZUNIONSTORE", Support, Normal, Complex, Write;
    Zinter => "ZINTER", Support, Normal, Complex, Read;
    Zunion => "ZUNION", Support, Normal, Complex, Read;
    Zdiff => "ZDIFF", Support, Normal, Complex, Read;
    Zmpop => "ZMPOP", Support, Normal, Complex, Write;

    // geo
    Geoadd => "GEOADD", Support, Normal, SimpleSingle, Write;
    Geodist => "GEODIST", Support, Normal, SimpleSingle, Read;
    Geohash => "GEOHASH", Support, Normal, SimpleSingle, Read;
    Geopos => "GEOPOS", Support, Normal, SimpleSingle, Read;
    Georadius => "GEORADIUS", Support, Normal, SimpleSingle, Write;
    Georadiusbymember => "GEORADIUSBYMEMBER", Support, Normal, SimpleSingle, Write;
    Geosearch => "GEOSEARCH", Support, Normal, SimpleSingle, Read;

    // streams
    Xadd => "XADD", Support, Normal, SimpleSingle, Write;
    Xlen => "XLEN", Support, Normal, SimpleSingle, Read;
    Xrange => "XRANGE", Support, Normal, SimpleSingle, Read;
    Xrevrange => "XREVRANGE", Support, Normal, SimpleSingle, Read;
    Xdel => "XDEL", Support, Normal, SimpleSingle, Write;
    Xtrim => "XTRIM", Support, Normal, SimpleSingle, Write;
    Xack => "XACK", Support, Normal, SimpleSingle, Write;
    Xpending => "XPENDING", Support, Normal, SimpleSingle, Read;
    Xclaim => "XCLAIM", Support, Normal, SimpleSingle, Write;
    Xautoclaim => "XAUTOCLAIM", Support, Normal, SimpleSingle, Write;
    Xread => "XREAD", Support, Normal, Complex, Read;
    Xreadgroup => "XREADGROUP", Support, Normal, Complex, Write;

    // scripting and transactions
    Eval => "EVAL", Support, Normal, Complex, Write;
    Evalsha => "EVALSHA", Support, Normal, Complex, Write;
    Script => "SCRIPT", Support, Normal, None, Other;
    Multi => "MULTI", Support, Normal, None, Other;
    Exec => "EXEC", Support, Normal, None, Other;
    Discard => "DISCARD", Support, Normal, None, Other;
    Watch => "WATCH", Support, Normal, SimpleMulti, Other;
    Unwatch => "UNWATCH", Support, Normal, None, Other;

    // pub/sub
    Subscribe => "SUBSCRIBE", Support, Normal, None, Other;
    Psubscribe => "PSUBSCRIBE", Support, Normal, None, Other;
    Unsubscribe => "UNSUBSCRIBE", Support, Normal, None, Other;
    Punsubscribe => "PUNSUBSCRIBE", Support, Normal, None, Other;
    Publish => "PUBLISH", Support, Normal, None, Write;
    Pubsub => "PUBSUB", Support, Normal, None, Other;

    // server administration, never proxied
    Flushall => "FLUSHALL", NotSupport, Normal, None, Write;
    Flushdb => "FLUSHDB", NotSupport, Normal, None, Write;
    Save => "SAVE", NotSupport, Normal, None, Other;
    Bgsave => "BGSAVE", NotSupport, Normal, None, Other;
    Bgrewriteaof => "BGREWRITEAOF", NotSupport, Normal, None, Other;
    Lastsave => "LASTSAVE", NotSupport, Normal, None, Other;
    Shutdown => "SHUTDOWN", NotSupport, Normal, None, Other;
    Slaveof => "SLAVEOF", NotSupport, Normal, None, Other;
    Replicaof => "REPLICAOF", NotSupport, Normal, None, Other;
    Sync => "SYNC", NotSupport, Normal, None, Other;
    Psync => "PSYNC", NotSupport, Normal, None, Other;
    Monitor => "MONITOR", NotSupport, Normal, None, Other;
    Debug => "DEBUG", NotSupport, Normal, None, Other;
    Slowlog => "SLOWLOG", NotSupport, Normal, None, Other;
    Wait => "WAIT", NotSupport, Normal, None, Other;
    Readonly => "READONLY", NotSupport, Normal, None, Other;
    Readwrite => "READWRITE", NotSupport, Normal, None, Other;
    Command => "COMMAND", NotSupport, Normal, None, Other;
    Acl => "ACL", NotSupport, Normal, None, Other;
}

static BY_NAME: Lazy<HashMap<&'static str, RedisCommand>> = Lazy::new(|| {
    RedisCommand::ALL
        .iter()
        .map(|command| (command.name(), *command))
        .collect()
});

impl RedisCommand {
    /// Case-insensitive lookup by the command name as received on the wire.
    pub fn from_name(name: &[u8]) -> Option<RedisCommand> {
        let mut upper = [0u8; 32];
        if name.is_empty() || name.len() > upper.len() {
            return None;
        }
        for (slot, byte) in upper.iter_mut().zip(name) {
            *slot = byte.to_ascii_uppercase();
        }
        let name = std::str::from_utf8(&upper[..name.len()]).ok()?;
        BY_NAME.get(name).copied()
    }

    pub fn is_subscribe(self) -> bool {
        matches!(self, RedisCommand::Subscribe | RedisCommand::Psubscribe)
    }

    /// Commands a connection may still issue while it is in subscribe mode.
    pub fn allowed_in_subscribe(self) -> bool {
        matches!(
            self,
            RedisCommand::Subscribe
                | RedisCommand::Psubscribe
                | RedisCommand::Unsubscribe
                | RedisCommand::Punsubscribe
                | RedisCommand::Ping
                | RedisCommand::Quit
        )
    }

    pub fn is_pubsub(self) -> bool {
        self.allowed_in_subscribe() && !matches!(self, RedisCommand::Ping | RedisCommand::Quit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(RedisCommand::from_name(b"get"), Some(RedisCommand::Get));
        assert_eq!(RedisCommand::from_name(b"GeT"), Some(RedisCommand::Get));
        assert_eq!(RedisCommand::from_name(b"nosuchcommand"), None);
        assert_eq!(RedisCommand::from_name(b""), None);
    }

    #[test]
    fn names_are_unique() {
        assert_eq!(BY_NAME.len(), RedisCommand::ALL.len());
    }

    #[test]
    fn session_commands_are_db_typed() {
        for command in [
            RedisCommand::Ping,
            RedisCommand::Auth,
            RedisCommand::Select,
            RedisCommand::Cluster,
        ] {
            assert_eq!(command.command_type(), CommandType::Db);
        }
        assert_eq!(RedisCommand::Get.command_type(), CommandType::Normal);
        assert_eq!(RedisCommand::Keys.support_type(), SupportType::NotSupport);
    }

    #[test]
    fn subscribe_allow_list() {
        assert!(RedisCommand::Ping.allowed_in_subscribe());
        assert!(RedisCommand::Punsubscribe.allowed_in_subscribe());
        assert!(!RedisCommand::Get.allowed_in_subscribe());
        assert!(RedisCommand::Subscribe.is_pubsub());
        assert!(!RedisCommand::Ping.is_pubsub());
    }
}
