// Copyright (C) 2022 Filmcdn, Inc.
//
// Filmcdn is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@filmcdn.dev.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::Cache;
use crate::CacheResult;

/// Redis-backed cache. The connection manager transparently reconnects, so
/// one instance is shared by every request and scheduler job.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connects to the redis instance at `host:port`.
    pub async fn connect(host: &str, port: u16) -> CacheResult<RedisCache> {
        let client = redis::Client::open(format!("redis://{}:{}/", host, port))?;
        let manager = ConnectionManager::new(client).await?;
        info!(host = %host, port = %port, "Connected to redis.");
        Ok(RedisCache { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut keys: Vec<String> = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn incr_and_expire(&self, key: &str, ttl_secs: u64) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let (counter, _): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl_secs as i64)
            .query_async(&mut conn)
            .await?;
        Ok(counter)
    }
}
