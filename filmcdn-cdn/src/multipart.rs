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

//! Resumable multipart upload driver.
//!
//! The driver is fed by a [`ChunkSource`]: either an in-memory client
//! payload or ranged GETs against the origin. Parts are uploaded strictly
//! sequentially; after every acknowledged part the upload record is written
//! back to the cache, so an interrupted upload resumes from its last part.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use filmcdn_config::PART_SIZE_MINIMUM;
use filmcdn_storage::{Cache, ObjectPart, ObjectStorage};
use tracing::info;

use crate::model::{record_key, unix_now, Collection, UploadRecord, UploadStatus};
use crate::{CdnError, CdnResult};

/// Supplies the next part payload. An empty chunk signals the end of the
/// stream; every chunk before the last one is exactly the part size.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> CdnResult<Bytes>;
}

/// Slices an in-memory payload into parts. The HTTP layer buffers the
/// uploaded form part before handing it over, so the total size is known up
/// front.
pub struct BytesChunkSource {
    data: Bytes,
    part_size: usize,
    offset: usize,
}

impl BytesChunkSource {
    pub fn new(data: Bytes, part_size: u64) -> BytesChunkSource {
        BytesChunkSource {
            data,
            part_size: part_size as usize,
            offset: 0,
        }
    }
}

#[async_trait]
impl ChunkSource for BytesChunkSource {
    async fn next_chunk(&mut self) -> CdnResult<Bytes> {
        if self.offset >= self.data.len() {
            return Ok(Bytes::new());
        }
        let end = (self.offset + self.part_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(chunk)
    }
}

/// Reads part `i` as a ranged GET against the origin. The object never
/// touches local disk on the replication path.
pub struct RangedGetChunkSource {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    object_name: String,
    total_size: u64,
    part_size: u64,
    offset: u64,
}

impl RangedGetChunkSource {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        object_name: impl Into<String>,
        total_size: u64,
        part_size: u64,
    ) -> RangedGetChunkSource {
        RangedGetChunkSource {
            storage,
            bucket: bucket.into(),
            object_name: object_name.into(),
            total_size,
            part_size,
            offset: 0,
        }
    }
}

#[async_trait]
impl ChunkSource for RangedGetChunkSource {
    async fn next_chunk(&mut self) -> CdnResult<Bytes> {
        if self.offset >= self.total_size {
            return Ok(Bytes::new());
        }
        let len = self.part_size.min(self.total_size - self.offset);
        let chunk = self
            .storage
            .get_range(&self.bucket, &self.object_name, self.offset, len)
            .await?;
        self.offset += chunk.len() as u64;
        Ok(chunk)
    }
}

/// Drives one multipart upload to completion, persisting progress to the
/// cache after every part.
#[derive(Clone)]
pub struct MultipartUploader {
    cache: Arc<dyn Cache>,
    part_size: u64,
}

impl MultipartUploader {
    pub fn new(cache: Arc<dyn Cache>, part_size: u64) -> MultipartUploader {
        // Enforced at configuration load; repeated here because a smaller
        // part would make the store reject every part but the last.
        assert!(part_size > PART_SIZE_MINIMUM);
        MultipartUploader { cache, part_size }
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Uploads `object_name` to `target`, resuming a previous attempt when
    /// the cache holds an unfinished record for the same composite key.
    ///
    /// On resume, parts already acknowledged by the store are skipped after
    /// a strict length check; a length divergence means the source stream no
    /// longer matches the remote history and fails the upload loudly.
    ///
    /// Writing the `finished` record is the single commit point: observers
    /// reading `finished` may assume the object is durable on the target.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload(
        &self,
        target: &dyn ObjectStorage,
        bucket: &str,
        object_name: &str,
        content_type: Option<&str>,
        total_size: u64,
        source: &mut dyn ChunkSource,
        collection: Collection,
        status: UploadStatus,
        node_url: &str,
    ) -> CdnResult<()> {
        let key = record_key(collection, object_name, node_url);
        let existing_record = UploadRecord::fetch(self.cache.as_ref(), &key).await?;
        let (upload_id, remote_parts) = match existing_record {
            Some(record) if record.status == UploadStatus::Finished => {
                return Err(CdnError::AlreadyUploaded {
                    object_name: object_name.to_string(),
                    endpoint: node_url.to_string(),
                });
            }
            Some(record) => {
                info!(upload_id = %record.mpu_id, object_name = %object_name, "Continuing upload.");
                let remote_parts = target
                    .list_parts(bucket, object_name, &record.mpu_id)
                    .await?;
                (record.mpu_id, remote_parts)
            }
            None => {
                let upload_id = target
                    .create_multipart_upload(bucket, object_name, content_type)
                    .await?;
                info!(upload_id = %upload_id, object_name = %object_name, "Starting upload.");
                (upload_id, Vec::new())
            }
        };

        let mut completed_parts: Vec<ObjectPart> = Vec::new();
        let mut uploaded_bytes: u64 = 0;
        let mut part_number: u64 = 1;
        loop {
            let data = source.next_chunk().await?;
            if data.is_empty() {
                break;
            }
            let data_len = data.len() as u64;
            let prior_part = remote_parts
                .iter()
                .find(|part| part.part_number == part_number);
            if let Some(prior_part) = prior_part {
                // Already uploaded, go to the next one.
                if data_len != prior_part.size {
                    return Err(CdnError::PartSizeMismatch {
                        part_number,
                        local: data_len,
                        remote: prior_part.size,
                    });
                }
                completed_parts.push(prior_part.clone());
            } else {
                let etag = target
                    .upload_part(bucket, object_name, &upload_id, part_number, data)
                    .await?;
                let record = UploadRecord {
                    mpu_id: upload_id.clone(),
                    part_number,
                    etag: etag.clone(),
                    uploaded: uploaded_bytes + data_len,
                    size: total_size,
                    last_modified: unix_now(),
                    status,
                };
                record.store(self.cache.as_ref(), &key).await?;
                completed_parts.push(ObjectPart {
                    part_number,
                    etag,
                    size: data_len,
                });
            }
            uploaded_bytes += data_len;
            info!(
                object_name = %object_name,
                uploaded_bytes = uploaded_bytes,
                total_size = total_size,
                percent = percent(uploaded_bytes, total_size),
                "Part uploaded."
            );
            part_number += 1;
        }

        target
            .complete_multipart_upload(bucket, object_name, &upload_id, &completed_parts)
            .await?;
        self.cache
            .hash_set(
                &key,
                &[
                    ("status".to_string(), UploadStatus::Finished.to_string()),
                    ("uploaded".to_string(), total_size.to_string()),
                    ("size".to_string(), total_size.to_string()),
                    ("last_modified".to_string(), unix_now().to_string()),
                ],
            )
            .await?;
        info!(object_name = %object_name, node_url = %node_url, "Upload completed.");
        Ok(())
    }
}

fn percent(num: u64, denom: u64) -> f64 {
    if denom == 0 {
        return 100.0;
    }
    num as f64 / denom as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use filmcdn_storage::{MockObjectStorage, RamCache, S3Error};
    use mockall::predicate::eq;

    use super::*;
    use crate::model::object_name_from_key;

    const PART_SIZE: u64 = 5 * 1024 * 1024 + 1;
    const BUCKET: &str = "movies";
    const ORIGIN_URL: &str = "http://origin:9000";

    fn uploader() -> (Arc<RamCache>, MultipartUploader) {
        let cache = Arc::new(RamCache::new());
        let uploader = MultipartUploader::new(cache.clone(), PART_SIZE);
        (cache, uploader)
    }

    #[tokio::test]
    async fn test_bytes_chunk_source_boundaries() {
        // An object of exactly k * part_size yields k parts and no trailing
        // empty part.
        let mut source = BytesChunkSource::new(Bytes::from(vec![7u8; 6]), 3);
        assert_eq!(source.next_chunk().await.unwrap().len(), 3);
        assert_eq!(source.next_chunk().await.unwrap().len(), 3);
        assert!(source.next_chunk().await.unwrap().is_empty());

        // A smaller object yields a single part.
        let mut source = BytesChunkSource::new(Bytes::from(vec![7u8; 2]), 3);
        assert_eq!(source.next_chunk().await.unwrap().len(), 2);
        assert!(source.next_chunk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ranged_get_chunk_source() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_get_range()
            .with(eq(BUCKET), eq("movie.mp4"), eq(0u64), eq(4u64))
            .times(1)
            .returning(|_, _, _, _| Ok(Bytes::from(vec![1u8; 4])));
        storage
            .expect_get_range()
            .with(eq(BUCKET), eq("movie.mp4"), eq(4u64), eq(2u64))
            .times(1)
            .returning(|_, _, _, _| Ok(Bytes::from(vec![2u8; 2])));
        let mut source =
            RangedGetChunkSource::new(Arc::new(storage), BUCKET, "movie.mp4", 6, 4);
        assert_eq!(source.next_chunk().await.unwrap().len(), 4);
        assert_eq!(source.next_chunk().await.unwrap().len(), 2);
        assert!(source.next_chunk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_upload_writes_parts_and_finishes() {
        let (cache, uploader) = uploader();
        let total_size = PART_SIZE + 1;
        let mut storage = MockObjectStorage::new();
        storage
            .expect_create_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok("mpu-1".to_string()));
        storage
            .expect_upload_part()
            .withf(|_, _, _, part_number, data| {
                (*part_number == 1 && data.len() as u64 == PART_SIZE)
                    || (*part_number == 2 && data.len() == 1)
            })
            .times(2)
            .returning(|_, _, _, part_number, _| Ok(format!("\"etag-{}\"", part_number)));
        storage
            .expect_complete_multipart_upload()
            .withf(|_, _, upload_id, parts| {
                upload_id == "mpu-1"
                    && parts.len() == 2
                    && parts[0].part_number == 1
                    && parts[1].part_number == 2
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut source =
            BytesChunkSource::new(Bytes::from(vec![0u8; total_size as usize]), PART_SIZE);
        uploader
            .upload(
                &storage,
                BUCKET,
                "movie.mp4",
                Some("video/mp4"),
                total_size,
                &mut source,
                Collection::Api,
                UploadStatus::InProgress,
                ORIGIN_URL,
            )
            .await
            .unwrap();

        let key = record_key(Collection::Api, "movie.mp4", ORIGIN_URL);
        let record = UploadRecord::fetch(cache.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::Finished);
        assert_eq!(record.uploaded, total_size);
        assert_eq!(record.size, total_size);
    }

    #[tokio::test]
    async fn test_resume_skips_uploaded_parts() {
        let (cache, uploader) = uploader();
        let total_size = 2 * PART_SIZE;
        let key = record_key(Collection::Api, "movie.mp4", ORIGIN_URL);
        let interrupted = UploadRecord {
            mpu_id: "mpu-7".to_string(),
            part_number: 1,
            etag: "\"etag-1\"".to_string(),
            uploaded: PART_SIZE,
            size: total_size,
            last_modified: unix_now(),
            status: UploadStatus::InProgress,
        };
        interrupted.store(cache.as_ref(), &key).await.unwrap();

        let mut storage = MockObjectStorage::new();
        storage.expect_create_multipart_upload().times(0);
        storage
            .expect_list_parts()
            .with(eq(BUCKET), eq("movie.mp4"), eq("mpu-7"))
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![ObjectPart {
                    part_number: 1,
                    etag: "\"etag-1\"".to_string(),
                    size: PART_SIZE,
                }])
            });
        // Part 1 is already on the store: only part 2 gets uploaded.
        storage
            .expect_upload_part()
            .withf(|_, _, upload_id, part_number, _| upload_id == "mpu-7" && *part_number == 2)
            .times(1)
            .returning(|_, _, _, _, _| Ok("\"etag-2\"".to_string()));
        storage
            .expect_complete_multipart_upload()
            .withf(|_, _, _, parts| parts.len() == 2)
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut source =
            BytesChunkSource::new(Bytes::from(vec![0u8; total_size as usize]), PART_SIZE);
        uploader
            .upload(
                &storage,
                BUCKET,
                "movie.mp4",
                None,
                total_size,
                &mut source,
                Collection::Api,
                UploadStatus::InProgress,
                ORIGIN_URL,
            )
            .await
            .unwrap();

        let record = UploadRecord::fetch(cache.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::Finished);
    }

    #[tokio::test]
    async fn test_resume_size_mismatch_is_fatal() {
        let (cache, uploader) = uploader();
        let key = record_key(Collection::Api, "movie.mp4", ORIGIN_URL);
        let interrupted = UploadRecord {
            mpu_id: "mpu-7".to_string(),
            part_number: 1,
            etag: "\"etag-1\"".to_string(),
            uploaded: PART_SIZE,
            size: 2 * PART_SIZE,
            last_modified: unix_now(),
            status: UploadStatus::InProgress,
        };
        interrupted.store(cache.as_ref(), &key).await.unwrap();

        let mut storage = MockObjectStorage::new();
        storage.expect_list_parts().times(1).returning(|_, _, _| {
            Ok(vec![ObjectPart {
                part_number: 1,
                etag: "\"etag-1\"".to_string(),
                // The remote history does not match what the source streams.
                size: PART_SIZE - 7,
            }])
        });
        storage.expect_upload_part().times(0);
        storage.expect_complete_multipart_upload().times(0);

        let mut source = BytesChunkSource::new(
            Bytes::from(vec![0u8; 2 * PART_SIZE as usize]),
            PART_SIZE,
        );
        let upload_err = uploader
            .upload(
                &storage,
                BUCKET,
                "movie.mp4",
                None,
                2 * PART_SIZE,
                &mut source,
                Collection::Api,
                UploadStatus::InProgress,
                ORIGIN_URL,
            )
            .await
            .unwrap_err();
        assert!(matches!(upload_err, CdnError::PartSizeMismatch { part_number: 1, .. }));

        // The record is left in place for the scheduler to reconcile.
        let record = UploadRecord::fetch(cache.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, UploadStatus::InProgress);
    }

    #[tokio::test]
    async fn test_finished_record_rejects_re_upload() {
        let (cache, uploader) = uploader();
        let key = record_key(Collection::Api, "movie.mp4", ORIGIN_URL);
        cache
            .hash_set(
                &key,
                &[
                    ("status".to_string(), "finished".to_string()),
                    ("last_modified".to_string(), unix_now().to_string()),
                ],
            )
            .await
            .unwrap();

        let storage = MockObjectStorage::new();
        let mut source = BytesChunkSource::new(Bytes::from(vec![0u8; 10]), PART_SIZE);
        let upload_err = uploader
            .upload(
                &storage,
                BUCKET,
                "movie.mp4",
                None,
                10,
                &mut source,
                Collection::Api,
                UploadStatus::InProgress,
                ORIGIN_URL,
            )
            .await
            .unwrap_err();
        assert!(matches!(upload_err, CdnError::AlreadyUploaded { .. }));
    }

    #[tokio::test]
    async fn test_s3_error_propagates_and_record_stays() {
        let (cache, uploader) = uploader();
        let mut storage = MockObjectStorage::new();
        storage
            .expect_create_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok("mpu-9".to_string()));
        storage
            .expect_upload_part()
            .withf(|_, _, _, part_number, _| *part_number == 1)
            .times(1)
            .returning(|_, _, _, _, _| Ok("\"etag-1\"".to_string()));
        storage
            .expect_upload_part()
            .withf(|_, _, _, part_number, _| *part_number == 2)
            .times(1)
            .returning(|_, _, _, _, _| {
                Err(S3Error::Failed {
                    source: anyhow::anyhow!("connection reset by peer"),
                })
            });
        storage.expect_complete_multipart_upload().times(0);

        let total_size = PART_SIZE + 1;
        let mut source =
            BytesChunkSource::new(Bytes::from(vec![0u8; total_size as usize]), PART_SIZE);
        let upload_err = uploader
            .upload(
                &storage,
                BUCKET,
                "movie.mp4",
                None,
                total_size,
                &mut source,
                Collection::Api,
                UploadStatus::InProgress,
                ORIGIN_URL,
            )
            .await
            .unwrap_err();
        assert!(matches!(upload_err, CdnError::S3(_)));

        // Progress through part 1 survived for the resume path.
        let key = record_key(Collection::Api, "movie.mp4", ORIGIN_URL);
        let record = UploadRecord::fetch(cache.as_ref(), &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.part_number, 1);
        assert_eq!(record.status, UploadStatus::InProgress);
        assert_eq!(object_name_from_key(&key), Some("movie.mp4"));
    }
}
