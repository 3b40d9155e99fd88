//! Request/response side of the Redis store.
//!
//! Transactions are sent as one atomic pipeline (`MULTI ... EXEC`). Redis
//! answers a transaction whose watched keys changed with a nil reply, which
//! surfaces here as `Ok(None)`.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::interfaces::{Command, Reply, ReplyKind, Store};

/// One Redis connection.
///
/// WATCH state lives on the server side of this connection, so a registry
/// runs every transaction on one `RedisStore` under its serialization lock.
/// A reconnect by the connection manager drops WATCH state on the server.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(client: Client) -> Result<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn to_cmd(command: &Command) -> redis::Cmd {
    let mut cmd = redis::cmd(command.name());
    for arg in command.args() {
        cmd.arg(arg);
    }
    cmd
}

fn unexpected(command: &'static str, value: &Value) -> Error {
    Error::UnexpectedReply {
        command,
        reply: format!("{:?}", value),
    }
}

/// Decode a raw reply according to the shape the command produces.
fn decode(command: &Command, value: Value) -> Result<Reply> {
    let name = command.name();
    let reply = match command.reply_kind() {
        ReplyKind::Status => Reply::Ok,
        ReplyKind::Int => {
            let n: i64 = redis::from_redis_value(&value).map_err(|_| unexpected(name, &value))?;
            Reply::Int(n)
        }
        ReplyKind::Bulk => {
            let data: Option<String> =
                redis::from_redis_value(&value).map_err(|_| unexpected(name, &value))?;
            data.map_or(Reply::Nil, Reply::Data)
        }
        ReplyKind::Array => {
            let items: Vec<String> =
                redis::from_redis_value(&value).map_err(|_| unexpected(name, &value))?;
            Reply::Array(items)
        }
        ReplyKind::Scored => {
            let flat: Vec<String> =
                redis::from_redis_value(&value).map_err(|_| unexpected(name, &value))?;
            let mut scored = Vec::with_capacity(flat.len() / 2);
            for pair in flat.chunks(2) {
                let [member, score] = pair else {
                    return Err(unexpected(name, &value));
                };
                let score: f64 = score.parse().map_err(|_| unexpected(name, &value))?;
                scored.push((member.clone(), score));
            }
            Reply::Scored(scored)
        }
        ReplyKind::Map => {
            let map = redis::from_redis_value(&value).map_err(|_| unexpected(name, &value))?;
            Reply::Map(map)
        }
    };
    Ok(reply)
}

#[async_trait]
impl Store for RedisStore {
    async fn watch(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        Ok(())
    }

    async fn unwatch(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
        Ok(())
    }

    async fn query(&self, command: Command) -> Result<Reply> {
        let mut conn = self.conn.clone();
        let value: Value = to_cmd(&command).query_async(&mut conn).await?;
        decode(&command, value)
    }

    async fn exec(&self, commands: Vec<Command>) -> Result<Option<Vec<Reply>>> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }

        let values: Option<Vec<Value>> = pipe.query_async(&mut conn).await?;
        let Some(values) = values else {
            debug!(commands = commands.len(), "Transaction aborted by watched key");
            return Ok(None);
        };

        if values.len() != commands.len() {
            return Err(Error::UnexpectedReply {
                command: "EXEC",
                reply: format!("{} replies for {} commands", values.len(), commands.len()),
            });
        }

        commands
            .iter()
            .zip(values)
            .map(|(command, value)| decode(command, value))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        // Sub-millisecond timeouts would round to 0, which blocks forever.
        let seconds = if timeout.is_zero() {
            0.0
        } else {
            timeout.as_secs_f64().max(0.001)
        };
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scored_pairs() {
        let command = Command::ZRange {
            key: "z".to_string(),
            start: 0,
            stop: -1,
            withscores: true,
        };
        let value = Value::Array(vec![
            Value::BulkString(b"a".to_vec()),
            Value::BulkString(b"1".to_vec()),
            Value::BulkString(b"b".to_vec()),
            Value::BulkString(b"2.5".to_vec()),
        ]);

        let reply = decode(&command, value).unwrap();
        assert_eq!(
            reply,
            Reply::Scored(vec![("a".to_string(), 1.0), ("b".to_string(), 2.5)])
        );
    }

    #[test]
    fn test_decode_nil_bulk() {
        let command = Command::HGet {
            key: "h".to_string(),
            field: "f".to_string(),
        };
        assert_eq!(decode(&command, Value::Nil).unwrap(), Reply::Nil);
    }

    #[test]
    fn test_decode_int_mismatch_is_unexpected_reply() {
        let command = Command::Incr("k".to_string());
        let err = decode(&command, Value::Array(vec![])).unwrap_err();
        assert!(matches!(err, Error::UnexpectedReply { command: "INCR", .. }));
    }

    #[test]
    fn test_to_cmd_includes_args() {
        let cmd = to_cmd(&Command::LRem {
            key: "l".to_string(),
            count: 1,
            value: "x".to_string(),
        });
        let packed = String::from_utf8(cmd.get_packed_command()).unwrap();
        assert!(packed.contains("LREM"));
        assert!(packed.contains("\r\nx\r\n"));
    }
}
