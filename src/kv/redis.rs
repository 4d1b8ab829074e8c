//! Redis-backed KV store.
//!
//! Thin command wrapper over a multiplexed async connection. Every command
//! (including connection acquisition) runs under a short deadline so the
//! hot path never blocks longer than a single round trip.

use std::time::Duration;

use async_trait::async_trait;
use redis::{FromRedisValue, Value, aio::MultiplexedConnection};

use super::{
    error::{KvError, KvResult},
    store::{KvOp, KvReply, KvStore},
};

pub struct RedisKv {
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisKv {
    pub fn new(url: &str, command_timeout: Duration) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            command_timeout,
        })
    }

    async fn conn(&self) -> KvResult<MultiplexedConnection> {
        match tokio::time::timeout(
            self.command_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> KvResult<T> {
        let mut conn = self.conn().await?;
        match tokio::time::timeout(self.command_timeout, cmd.query_async(&mut conn)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Timeout),
        }
    }

    fn value_to_reply(value: Value) -> KvReply {
        match value {
            Value::Nil => KvReply::Nil,
            Value::Int(n) => KvReply::Int(n),
            Value::Okay => KvReply::Ok,
            Value::SimpleString(s) => {
                if s == "OK" {
                    KvReply::Ok
                } else {
                    KvReply::Text(s)
                }
            }
            Value::BulkString(bytes) => KvReply::Text(String::from_utf8_lossy(&bytes).to_string()),
            Value::Array(items) => KvReply::Array(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::BulkString(bytes) => {
                            Some(String::from_utf8_lossy(&bytes).to_string())
                        }
                        Value::SimpleString(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            other => KvReply::Text(format!("{:?}", other)),
        }
    }

    fn apply_op(pipe: &mut redis::Pipeline, op: &KvOp) {
        match op {
            KvOp::Get(key) => {
                pipe.cmd("GET").arg(key);
            }
            KvOp::Set { key, value, ttl } => match ttl {
                Some(ttl) if ttl.as_secs() > 0 => {
                    pipe.cmd("SETEX").arg(key).arg(ttl.as_secs()).arg(value);
                }
                _ => {
                    pipe.cmd("SET").arg(key).arg(value);
                }
            },
            KvOp::Del(key) => {
                pipe.cmd("DEL").arg(key);
            }
            KvOp::IncrBy { key, delta } => {
                pipe.cmd("INCRBY").arg(key).arg(delta);
            }
            KvOp::HIncrBy { key, field, delta } => {
                pipe.cmd("HINCRBY").arg(key).arg(field).arg(delta);
            }
            KvOp::LPush { key, values } => {
                let mut cmd = redis::cmd("LPUSH");
                cmd.arg(key);
                for value in values {
                    cmd.arg(value);
                }
                pipe.add_command(cmd);
            }
            KvOp::LTrim { key, start, stop } => {
                pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop);
            }
            KvOp::ExpireNx { key, ttl } => {
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs()).arg("NX");
            }
            KvOp::Keys(pattern) => {
                pipe.cmd("KEYS").arg(pattern);
            }
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.run(redis::cmd("GET").arg(key).to_owned()).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let cmd = match ttl {
            Some(ttl) if ttl.as_secs() > 0 => redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs())
                .arg(value)
                .to_owned(),
            _ => redis::cmd("SET").arg(key).arg(value).to_owned(),
        };
        self.run(cmd).await
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.run(redis::cmd("DEL").arg(key).to_owned()).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.run(redis::cmd("INCRBY").arg(key).arg(delta).to_owned())
            .await
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        self.run(cmd).await
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        self.run(redis::cmd("HGETALL").arg(key).to_owned()).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64> {
        self.run(
            redis::cmd("HINCRBY")
                .arg(key)
                .arg(field)
                .arg(delta)
                .to_owned(),
        )
        .await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<i64> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key);
        for value in values {
            cmd.arg(value);
        }
        self.run(cmd).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> KvResult<()> {
        self.run(
            redis::cmd("LTRIM")
                .arg(key)
                .arg(start)
                .arg(stop)
                .to_owned(),
        )
        .await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> KvResult<Vec<String>> {
        self.run(
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .to_owned(),
        )
        .await
    }

    async fn llen(&self, key: &str) -> KvResult<i64> {
        self.run(redis::cmd("LLEN").arg(key).to_owned()).await
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.run(redis::cmd("KEYS").arg(pattern).to_owned()).await
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let applied: i64 = self
            .run(
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .arg("NX")
                    .to_owned(),
            )
            .await?;
        Ok(applied == 1)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<KvReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for op in &ops {
            Self::apply_op(&mut pipe, op);
        }

        let mut conn = self.conn().await?;
        let values: Vec<Value> =
            match tokio::time::timeout(self.command_timeout, pipe.query_async(&mut conn)).await {
                Ok(result) => result?,
                Err(_) => return Err(KvError::Timeout),
            };

        Ok(values.into_iter().map(Self::value_to_reply).collect())
    }

    async fn ping(&self) -> KvResult<()> {
        let pong: String = self.run(redis::cmd("PING").to_owned()).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(KvError::Type(format!("unexpected PING reply: {}", pong)))
        }
    }
}
