//! Redis storage binding for `hacache`.
//!
//! Redis's nil reply is the store's "key absent" sentinel; it maps to
//! [`StorageError::Miss`] so the engine can tell a miss from an outage.

use std::time::Duration;

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use hacache::{Storage, StorageError};

/// [`Storage`] over a Redis server.
///
/// Built on a [`ConnectionManager`], which multiplexes one connection and
/// reconnects on its own; clones of this storage share it.
#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
}

impl RedisStorage {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// The initial connection is established eagerly so that
    /// misconfiguration surfaces here rather than on the first cache
    /// read.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(RedisStorage { connection })
    }

    /// Wraps an existing connection manager.
    pub fn new(connection: ConnectionManager) -> Self {
        RedisStorage { connection }
    }
}

impl Storage for RedisStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            let value: Option<Vec<u8>> = connection
                .get(key)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            value.ok_or(StorageError::Miss)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut connection = self.connection.clone();
            match ttl {
                Some(ttl) => {
                    connection
                        .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                        .await
                }
                None => connection.set::<_, _, ()>(key, value).await,
            }
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
    }
}
