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

mod error;
mod s3_compatible_storage;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use filmcdn_config::Node;

pub use self::s3_compatible_storage::{S3CompatibleObjectStorage, S3ObjectStorageFactory};
use crate::S3Result;

/// One part of a multipart upload, as acknowledged by the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPart {
    /// 1-based part number.
    pub part_number: u64,
    /// Entity tag returned by the store for this part.
    pub etag: String,
    /// Part length in bytes.
    pub size: u64,
}

/// Metadata learned from a ranged GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInfo {
    /// Length of the returned range.
    pub content_length: u64,
    /// Total object size, parsed from the `Content-Range` suffix.
    pub total_size: u64,
    /// Content type of the object, when the store reports one.
    pub content_type: Option<String>,
}

/// The capability set filmcdn requires from an object store.
///
/// Both the origin and the edge locations are S3-compatible and share this
/// interface; a concrete client is built per node with that node's
/// credentials.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Mints a time-limited (1 hour) credential-free GET URL.
    async fn presigned_url(&self, bucket: &str, object_name: &str) -> S3Result<String>;

    async fn bucket_exists(&self, bucket: &str) -> S3Result<bool>;

    /// Issues a ranged GET and discards the body. Fails with
    /// `S3Error::NotFound` when the object is missing.
    async fn head_range(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> S3Result<RangeInfo>;

    /// Fetches `[offset, offset + len)` of the object.
    async fn get_range(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> S3Result<Bytes>;

    async fn create_multipart_upload<'a>(
        &self,
        bucket: &str,
        object_name: &str,
        content_type: Option<&'a str>,
    ) -> S3Result<String>;

    /// Parts already uploaded under `upload_id`, sorted by part number.
    async fn list_parts(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
    ) -> S3Result<Vec<ObjectPart>>;

    /// Uploads one part and returns its etag.
    async fn upload_part(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
        part_number: u64,
        data: Bytes,
    ) -> S3Result<String>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
        parts: &[ObjectPart],
    ) -> S3Result<()>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
    ) -> S3Result<()>;

    /// Aborts every open multipart upload of the bucket.
    async fn abort_all_multipart_uploads(&self, bucket: &str) -> S3Result<()>;

    async fn delete_object(&self, bucket: &str, object_name: &str) -> S3Result<()>;
}

/// Builds (and may pool) one `ObjectStorage` client per node.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
pub trait ObjectStorageFactory: Send + Sync + 'static {
    fn for_node(&self, node: &Node) -> S3Result<Arc<dyn ObjectStorage>>;
}
