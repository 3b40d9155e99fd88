//! Store commands and their replies.
//!
//! Only the primitives the collections need are modelled. Each command knows
//! the shape of its reply so that backends can decode raw protocol values
//! without the caller spelling out types.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get(String),
    Set { key: String, value: String },
    Del(Vec<String>),
    Incr(String),

    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    SIsMember { key: String, member: String },
    SMembers(String),

    /// With `nx`, existing members keep their score.
    ZAdd {
        key: String,
        score: f64,
        member: String,
        nx: bool,
    },
    ZRem { key: String, member: String },
    ZScore { key: String, member: String },
    ZCard(String),
    ZRange {
        key: String,
        start: isize,
        stop: isize,
        withscores: bool,
    },

    LPush { key: String, value: String },
    RPush { key: String, value: String },
    LRem { key: String, count: isize, value: String },
    LInsert {
        key: String,
        before: bool,
        pivot: String,
        value: String,
    },
    LRange { key: String, start: isize, stop: isize },
    LLen(String),

    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    HDel { key: String, field: String },
    HExists { key: String, field: String },
    HGetAll(String),
    HIncrBy { key: String, field: String, delta: i64 },

    Publish { channel: String, message: String },
}

/// Shape of the reply a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Simple `OK` status.
    Status,
    Int,
    /// Bulk string, possibly nil.
    Bulk,
    /// Array of bulk strings.
    Array,
    /// Flat `member, score, member, score...` array.
    Scored,
    /// Flat `field, value, field, value...` array.
    Map,
}

impl Command {
    /// Protocol command name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get(_) => "GET",
            Command::Set { .. } => "SET",
            Command::Del(_) => "DEL",
            Command::Incr(_) => "INCR",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SIsMember { .. } => "SISMEMBER",
            Command::SMembers(_) => "SMEMBERS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZCard(_) => "ZCARD",
            Command::ZRange { .. } => "ZRANGE",
            Command::LPush { .. } => "LPUSH",
            Command::RPush { .. } => "RPUSH",
            Command::LRem { .. } => "LREM",
            Command::LInsert { .. } => "LINSERT",
            Command::LRange { .. } => "LRANGE",
            Command::LLen(_) => "LLEN",
            Command::HSet { .. } => "HSET",
            Command::HGet { .. } => "HGET",
            Command::HDel { .. } => "HDEL",
            Command::HExists { .. } => "HEXISTS",
            Command::HGetAll(_) => "HGETALL",
            Command::HIncrBy { .. } => "HINCRBY",
            Command::Publish { .. } => "PUBLISH",
        }
    }

    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Command::Set { .. } => ReplyKind::Status,
            Command::Get(_) | Command::ZScore { .. } | Command::HGet { .. } => ReplyKind::Bulk,
            Command::SMembers(_) | Command::LRange { .. } => ReplyKind::Array,
            Command::ZRange { withscores, .. } => {
                if *withscores {
                    ReplyKind::Scored
                } else {
                    ReplyKind::Array
                }
            }
            Command::HGetAll(_) => ReplyKind::Map,
            _ => ReplyKind::Int,
        }
    }

    /// Positional arguments after the command name.
    pub fn args(&self) -> Vec<String> {
        match self {
            Command::Get(key)
            | Command::Incr(key)
            | Command::SMembers(key)
            | Command::ZCard(key)
            | Command::LLen(key)
            | Command::HGetAll(key) => vec![key.clone()],
            Command::Del(keys) => keys.clone(),
            Command::Set { key, value } => vec![key.clone(), value.clone()],
            Command::SAdd { key, member }
            | Command::SRem { key, member }
            | Command::SIsMember { key, member }
            | Command::ZRem { key, member }
            | Command::ZScore { key, member } => vec![key.clone(), member.clone()],
            Command::ZAdd {
                key,
                score,
                member,
                nx,
            } => {
                let mut args = vec![key.clone()];
                if *nx {
                    args.push("NX".to_string());
                }
                args.push(format_score(*score));
                args.push(member.clone());
                args
            }
            Command::ZRange {
                key,
                start,
                stop,
                withscores,
            } => {
                let mut args = vec![key.clone(), start.to_string(), stop.to_string()];
                if *withscores {
                    args.push("WITHSCORES".to_string());
                }
                args
            }
            Command::LPush { key, value } | Command::RPush { key, value } => {
                vec![key.clone(), value.clone()]
            }
            Command::LRem { key, count, value } => {
                vec![key.clone(), count.to_string(), value.clone()]
            }
            Command::LInsert {
                key,
                before,
                pivot,
                value,
            } => vec![
                key.clone(),
                if *before { "BEFORE" } else { "AFTER" }.to_string(),
                pivot.clone(),
                value.clone(),
            ],
            Command::LRange { key, start, stop } => {
                vec![key.clone(), start.to_string(), stop.to_string()]
            }
            Command::HSet { key, field, value } => vec![key.clone(), field.clone(), value.clone()],
            Command::HGet { key, field }
            | Command::HDel { key, field }
            | Command::HExists { key, field } => vec![key.clone(), field.clone()],
            Command::HIncrBy { key, field, delta } => {
                vec![key.clone(), field.clone(), delta.to_string()]
            }
            Command::Publish { channel, message } => vec![channel.clone(), message.clone()],
        }
    }
}

/// Scores are millisecond timestamps; print them without a fractional part
/// when they have none so they read back identically.
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

/// Decoded reply to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Data(String),
    Array(Vec<String>),
    Scored(Vec<(String, f64)>),
    Map(HashMap<String, String>),
}

impl Reply {
    fn unexpected(&self, command: &'static str) -> Error {
        Error::UnexpectedReply {
            command,
            reply: format!("{:?}", self),
        }
    }

    pub fn into_int(self, command: &'static str) -> Result<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Data(ref s) => s.parse().map_err(|_| self.unexpected(command)),
            other => Err(other.unexpected(command)),
        }
    }

    /// Integer replies used as booleans (SISMEMBER, HEXISTS, ZADD...).
    pub fn into_bool(self, command: &'static str) -> Result<bool> {
        Ok(self.into_int(command)? != 0)
    }

    pub fn into_data(self, command: &'static str) -> Result<Option<String>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Data(s) => Ok(Some(s)),
            Reply::Int(n) => Ok(Some(n.to_string())),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_array(self, command: &'static str) -> Result<Vec<String>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_scored(self, command: &'static str) -> Result<Vec<(String, f64)>> {
        match self {
            Reply::Scored(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_map(self, command: &'static str) -> Result<HashMap<String, String>> {
        match self {
            Reply::Map(map) => Ok(map),
            Reply::Nil => Ok(HashMap::new()),
            other => Err(other.unexpected(command)),
        }
    }
}
