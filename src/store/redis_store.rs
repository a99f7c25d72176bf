use crate::error::{Result, ThrottlerError};
use crate::store::ScriptExecutor;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisResult};
use tracing::debug;

/// Redis-backed script executor over a multiplexed tokio connection.
///
/// Cloning is cheap and clones share the underlying connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        debug!(url = %redis_url, "Connected to Redis");

        Ok(Self { client, connection })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connection.clone();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        Ok(result?)
    }

    /// Delete a rate-limit key, returning whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl ScriptExecutor for RedisStore {
    async fn load_script(&self, source: &str) -> Result<String> {
        let mut conn = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await?;
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[String]) -> Result<Vec<i64>> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len()).arg(keys).arg(args);

        let result: RedisResult<Vec<i64>> = cmd.query_async(&mut conn).await;
        result.map_err(|e| match e.kind() {
            ErrorKind::NoScriptError => ThrottlerError::UnknownScript(sha.to_string()),
            _ => ThrottlerError::Redis(e),
        })
    }
}
