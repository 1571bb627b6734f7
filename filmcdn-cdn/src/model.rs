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

//! Cached upload state: one record per `(collection, object, node)`.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use filmcdn_storage::Cache;
use tracing::warn;

use crate::{CdnError, CdnResult};

/// Lifecycle of a multipart upload. Statuses only ever move forward:
/// `in_progress` → `scheduler_in_progress` → `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// Driven by a client request or a freshly enqueued replication.
    InProgress,
    /// Resumed by the reconciliation sweep.
    SchedulerInProgress,
    /// Complete has been called; the object is durable on the node.
    Finished,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::InProgress => "in_progress",
            UploadStatus::SchedulerInProgress => "scheduler_in_progress",
            UploadStatus::Finished => "finished",
        }
    }

    pub fn from_str(status_str: &str) -> Option<UploadStatus> {
        match status_str {
            "in_progress" => Some(UploadStatus::InProgress),
            "scheduler_in_progress" => Some(UploadStatus::SchedulerInProgress),
            "finished" => Some(UploadStatus::Finished),
            _ => None,
        }
    }

    /// Upload still running, whether request- or scheduler-driven.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            UploadStatus::InProgress | UploadStatus::SchedulerInProgress
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline owns the record: client→origin ingest or origin→edge
/// replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Api,
    Cdn,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Api => "api",
            Collection::Cdn => "cdn",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite cache key: `{collection}^{object_name}^{node_url}`.
pub fn record_key(collection: Collection, object_name: &str, node_url: &str) -> String {
    format!("{}^{}^{}", collection, object_name, node_url)
}

/// Recovers the object name from a composite key.
pub fn object_name_from_key(key: &str) -> Option<&str> {
    let first_sep = key.find('^')?;
    let last_sep = key.rfind('^')?;
    if first_sep == last_sep {
        return None;
    }
    Some(&key[first_sep + 1..last_sep])
}

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Cached state of one multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    /// Multipart upload id handed out by the object store. Meaningless once
    /// the upload is finished.
    pub mpu_id: String,
    /// Last part successfully uploaded.
    pub part_number: u64,
    /// Etag of that part.
    pub etag: String,
    /// Bytes uploaded so far.
    pub uploaded: u64,
    /// Total bytes expected.
    pub size: u64,
    /// Unix seconds of the last record write. Monotonically increases
    /// within an upload's lifetime.
    pub last_modified: i64,
    pub status: UploadStatus,
}

impl UploadRecord {
    pub fn fields(&self) -> Vec<(String, String)> {
        vec![
            ("mpu_id".to_string(), self.mpu_id.clone()),
            ("part_number".to_string(), self.part_number.to_string()),
            ("etag".to_string(), self.etag.clone()),
            ("uploaded".to_string(), self.uploaded.to_string()),
            ("size".to_string(), self.size.to_string()),
            ("last_modified".to_string(), self.last_modified.to_string()),
            ("status".to_string(), self.status.to_string()),
        ]
    }

    /// Rebuilds a record from cache hash fields. A record without a valid
    /// status is treated as absent; other fields degrade to defaults so that
    /// a partially cleared `finished` record still reads back.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<UploadRecord> {
        let status = UploadStatus::from_str(fields.get("status")?)?;
        let parse_u64 =
            |name: &str| -> u64 { fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0) };
        Some(UploadRecord {
            mpu_id: fields.get("mpu_id").cloned().unwrap_or_default(),
            part_number: parse_u64("part_number"),
            etag: fields.get("etag").cloned().unwrap_or_default(),
            uploaded: parse_u64("uploaded"),
            size: parse_u64("size"),
            last_modified: fields
                .get("last_modified")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            status,
        })
    }

    pub async fn fetch(cache: &dyn Cache, key: &str) -> CdnResult<Option<UploadRecord>> {
        let fields = match cache.hash_get_all(key).await.map_err(CdnError::from)? {
            Some(fields) => fields,
            None => return Ok(None),
        };
        let record = UploadRecord::from_fields(&fields);
        if record.is_none() {
            warn!(key = %key, "Ignoring a cache record with no valid status.");
        }
        Ok(record)
    }

    pub async fn store(&self, cache: &dyn Cache, key: &str) -> CdnResult<()> {
        cache
            .hash_set(key, &self.fields())
            .await
            .map_err(CdnError::from)
    }
}
