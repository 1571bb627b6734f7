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

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::Cache;
use crate::CacheResult;

/// In-RAM cache for tests and single-process experiments.
///
/// TTLs are accepted and ignored; pattern matching supports `*` wildcards
/// the way redis `SCAN MATCH` does.
#[derive(Default)]
pub struct RamCache {
    records: Mutex<BTreeMap<String, HashMap<String, String>>>,
    counters: Mutex<BTreeMap<String, i64>>,
}

impl RamCache {
    pub fn new() -> RamCache {
        RamCache::default()
    }
}

/// Matches `candidate` against a glob pattern where `*` spans any run of
/// characters.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == candidate;
    }
    let mut remaining = candidate;
    let last_idx = segments.len() - 1;
    for (idx, segment) in segments.iter().enumerate() {
        if idx == 0 {
            match remaining.strip_prefix(segment) {
                Some(rest) => remaining = rest,
                None => return false,
            }
        } else if idx == last_idx {
            return remaining.ends_with(segment);
        } else if !segment.is_empty() {
            match remaining.find(segment) {
                Some(pos) => remaining = &remaining[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl Cache for RamCache {
    async fn hash_get_all(&self, key: &str) -> CacheResult<Option<HashMap<String, String>>> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records.get(key).cloned())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> CacheResult<()> {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.records.lock().expect("lock poisoned").remove(key);
        self.counters.lock().expect("lock poisoned").remove(key);
        Ok(())
    }

    async fn keys_matching(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let records = self.records.lock().expect("lock poisoned");
        Ok(records
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn incr_and_expire(&self, key: &str, _ttl_secs: u64) -> CacheResult<i64> {
        let mut counters = self.counters.lock().expect("lock poisoned");
        let counter = counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}
