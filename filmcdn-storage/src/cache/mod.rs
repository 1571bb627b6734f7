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

mod ram_cache;
mod redis_cache;

use std::collections::HashMap;

use async_trait::async_trait;

pub use self::ram_cache::RamCache;
pub use self::redis_cache::RedisCache;
use crate::CacheResult;

/// The capability set filmcdn requires from its key/value cache.
///
/// The cache is the source of truth for upload state, rate counters and
/// single-flight signaling. Writes are last-write-wins per key.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// All hash fields stored under `key`, or `None` when the key is absent.
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>>;

    /// Upserts the given hash fields under `key`. Fields not listed are left
    /// untouched.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Keys matching a glob-style pattern, via cursor-based scanning.
    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Atomically increments `key` and refreshes its TTL; returns the new
    /// counter value.
    async fn incr_and_expire(&self, key: &str, ttl_secs: u64) -> CacheResult<i64>;
}
