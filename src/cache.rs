use deadpool_redis::Runtime;
use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::error::{BootError, Result};
use crate::logging::{LogFields, LogId, Module};
use crate::metrics;
use crate::trace::TraceHook;

/// Pool-facing view of a redis config section such as `default_redis`.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

/// Client-facing view of the same section. Deliberately narrower than
/// [`PoolConfig`]; both are deserialized from one file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

fn default_port() -> u16 {
    6379
}

fn default_max_size() -> usize {
    16
}

fn redis_url(host: &str, port: u16, password: &str, db: i64) -> String {
    if password.is_empty() {
        format!("redis://{host}:{port}/{db}")
    } else {
        format!("redis://:{password}@{host}:{port}/{db}")
    }
}

impl PoolConfig {
    pub fn url(&self) -> String {
        redis_url(&self.host, self.port, &self.password, self.db)
    }
}

impl ClientConfig {
    pub fn url(&self) -> String {
        redis_url(&self.host, self.port, &self.password, self.db)
    }
}

/// Low-level pooled access to redis. No tracing attached; callers that want
/// spans and structured command logs go through [`CacheClient`].
#[derive(Clone)]
pub struct CachePool {
    name: String,
    pool: deadpool_redis::Pool,
}

impl std::fmt::Debug for CachePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePool").field("name", &self.name).finish()
    }
}

impl CachePool {
    pub async fn connect(name: &str, cfg: &PoolConfig) -> Result<Self> {
        let mut pool_cfg = deadpool_redis::Config::from_url(cfg.url());
        pool_cfg.pool = Some(deadpool_redis::PoolConfig::new(cfg.max_size));
        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|source| BootError::CachePool {
                name: name.to_string(),
                source,
            })?;

        // Prove the server answers before handing the pool out.
        let mut conn = pool
            .get()
            .await
            .map_err(|err| BootError::Cache {
                name: name.to_string(),
                source: checkout_error(err),
            })?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|source| BootError::Cache {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.pool
    }

    pub async fn checkout(&self) -> redis::RedisResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(checkout_error)
    }
}

fn checkout_error(err: deadpool_redis::PoolError) -> redis::RedisError {
    match err {
        deadpool::managed::PoolError::Backend(err) => err,
        other => redis::RedisError::from((
            redis::ErrorKind::IoError,
            "pool checkout failed",
            other.to_string(),
        )),
    }
}

/// Higher-level redis client: a multiplexed connection with a span opened
/// around every command and a structured log line emitted afterwards.
#[derive(Clone)]
pub struct CacheClient {
    name: String,
    conn: MultiplexedConnection,
    hook: TraceHook,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").field("name", &self.name).finish()
    }
}

impl CacheClient {
    pub async fn connect(name: &str, cfg: &ClientConfig, hook: TraceHook) -> Result<Self> {
        let client =
            redis::Client::open(cfg.url()).map_err(|source| BootError::Cache {
                name: name.to_string(),
                source,
            })?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|source| BootError::Cache {
                name: name.to_string(),
                source,
            })?;

        let cache = Self {
            name: name.to_string(),
            conn,
            hook,
        };
        cache
            .ping(&LogId::generate())
            .await
            .map_err(|source| BootError::Cache {
                name: name.to_string(),
                source,
            })?;
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn ping(&self, log_id: &LogId) -> redis::RedisResult<()> {
        self.run::<String>(log_id, redis::cmd("PING"), "PING", String::new())
            .await
            .map(|_| ())
    }

    pub async fn get(&self, log_id: &LogId, key: &str) -> redis::RedisResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(log_id, cmd, "GET", key.to_string()).await
    }

    pub async fn set(
        &self,
        log_id: &LogId,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> redis::RedisResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs());
        }
        self.run::<String>(log_id, cmd, "SET", key.to_string())
            .await
            .map(|_| ())
    }

    pub async fn del(&self, log_id: &LogId, key: &str) -> redis::RedisResult<u64> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(log_id, cmd, "DEL", key.to_string()).await
    }

    async fn run<T: redis::FromRedisValue>(
        &self,
        log_id: &LogId,
        cmd: redis::Cmd,
        label: &'static str,
        detail: String,
    ) -> redis::RedisResult<T> {
        let start = Instant::now();
        let mut span = self.hook.command_span(label);
        let mut conn = self.conn.clone();
        let outcome = cmd.query_async::<T>(&mut conn).await;
        let seconds = start.elapsed().as_secs_f64();

        metrics::record_cache_command(label, outcome.is_ok(), seconds);

        let mut fields = LogFields::new(log_id.clone(), Module::Redis)
            .api(self.name.as_str())
            .method(label)
            .request(detail)
            .cost_ms(seconds * 1000.0);
        if let Some(trace_id) = self.hook.trace_id(&span) {
            fields = fields.trace_id(trace_id);
        }
        if let Err(err) = &outcome {
            self.hook.mark_error(&mut span, err);
            fields = fields.response(err.to_string()).code(1);
        }
        self.hook.finish(span);
        fields.emit("redis command");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_views_parse_one_section() {
        let raw = "host = \"127.0.0.1\"\nport = 6380\npassword = \"pw\"\ndb = 2\nmax_size = 32\n";
        let pool: PoolConfig = toml::from_str(raw).unwrap();
        let client: ClientConfig = toml::from_str(raw).unwrap();

        assert_eq!(pool.max_size, 32);
        assert_eq!(pool.url(), client.url());
        assert_eq!(client.url(), "redis://:pw@127.0.0.1:6380/2");
    }

    #[test]
    fn url_omits_empty_password() {
        let cfg: ClientConfig = toml::from_str("host = \"cache.internal\"\n").unwrap();
        assert_eq!(cfg.url(), "redis://cache.internal:6379/0");
    }

    #[test]
    fn pool_defaults_apply() {
        let cfg: PoolConfig = toml::from_str("host = \"localhost\"\n").unwrap();
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.db, 0);
        assert_eq!(cfg.max_size, 16);
    }
}
