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
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rusoto_core::{ByteStream, HttpClient, HttpConfig, Region, RusotoError};
use rusoto_credential::{AwsCredentials, StaticProvider};
use rusoto_s3::util::{PreSignedRequest, PreSignedRequestOption};
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CompletedPart, CreateMultipartUploadRequest, DeleteObjectRequest, GetObjectError,
    GetObjectOutput, GetObjectRequest, HeadBucketRequest, ListMultipartUploadsRequest,
    ListPartsRequest, S3Client, UploadPartRequest, S3,
};
use tracing::{debug, info};

use super::error::RusotoErrorWrapper;
use crate::object_storage::{ObjectPart, ObjectStorage, ObjectStorageFactory, RangeInfo};
use crate::retry::{with_backoff, BackoffPolicy};
use crate::{S3Error, S3Result};
use filmcdn_config::Node;

/// Lifetime of the GET URLs handed to clients.
const PRESIGNED_URL_EXPIRES: Duration = Duration::from_secs(3600);

/// S3-compatible object storage client for a single node.
///
/// Works against MinIO and any other store speaking the S3 protocol; the
/// node's endpoint becomes a custom region.
pub struct S3CompatibleObjectStorage {
    s3_client: S3Client,
    region: Region,
    credentials: AwsCredentials,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl fmt::Debug for S3CompatibleObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S3CompatibleObjectStorage(endpoint={})", &self.endpoint)
    }
}

fn create_s3_client(
    region: Region,
    access_key_id: &str,
    secret_access_key: &str,
) -> anyhow::Result<S3Client> {
    let credentials_provider =
        StaticProvider::new_minimal(access_key_id.to_string(), secret_access_key.to_string());
    let mut http_config: HttpConfig = HttpConfig::default();
    // We experience an issue similar to https://github.com/hyperium/hyper/issues/2312.
    // It seems like the setting below solved it.
    http_config.pool_idle_timeout(std::time::Duration::from_secs(10));
    let http_client = HttpClient::new_with_config(http_config)
        .with_context(|| "failed to create request dispatcher")?;
    Ok(S3Client::new_with(
        http_client,
        credentials_provider,
        region,
    ))
}

impl S3CompatibleObjectStorage {
    /// Creates a client for the given endpoint URL and static credentials.
    pub fn new(
        endpoint_url: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> anyhow::Result<S3CompatibleObjectStorage> {
        let endpoint = endpoint_url.trim_end_matches('/').to_string();
        let region = Region::Custom {
            name: "filmcdn-node".to_string(),
            endpoint: endpoint.clone(),
        };
        let s3_client = create_s3_client(region.clone(), access_key_id, secret_access_key)?;
        Ok(S3CompatibleObjectStorage {
            s3_client,
            region,
            credentials: AwsCredentials::new(access_key_id, secret_access_key, None, None),
            endpoint,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Creates a client for a registered node.
    pub fn for_node(node: &Node) -> anyhow::Result<S3CompatibleObjectStorage> {
        Self::new(&node.url(), &node.access_key_id, &node.secret_access_key)
    }

    fn range_get_request(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> GetObjectRequest {
        GetObjectRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            range: Some(format!("bytes={}-{}", offset, offset + len - 1)),
            ..Default::default()
        }
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> S3Result<GetObjectOutput> {
        let get_object_req = self.range_get_request(bucket, object_name, offset, len);
        with_backoff(&self.backoff, "get_object", || async {
            self.s3_client
                .get_object(get_object_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(get_object_s3_error)
    }
}

fn get_object_s3_error(err: RusotoErrorWrapper<GetObjectError>) -> S3Error {
    if let RusotoError::Service(GetObjectError::NoSuchKey(_)) = &err.0 {
        return S3Error::NotFound { source: err.into() };
    }
    err.into()
}

/// Parses the total object size out of a `Content-Range` header value such
/// as `bytes 0-0/1048576`.
fn parse_total_size(content_range: &str) -> Option<u64> {
    let (_, total) = content_range.rsplit_once('/')?;
    total.parse::<u64>().ok()
}

fn range_info_from_output(output: &GetObjectOutput) -> S3Result<RangeInfo> {
    let content_length = output.content_length.unwrap_or(0) as u64;
    let content_range = output.content_range.as_deref().ok_or_else(|| {
        S3Error::failed(anyhow::anyhow!("The response carried no Content-Range."))
    })?;
    let total_size = parse_total_size(content_range).ok_or_else(|| {
        S3Error::failed(anyhow::anyhow!(
            "Failed to parse total size from Content-Range `{}`.",
            content_range
        ))
    })?;
    Ok(RangeInfo {
        content_length,
        total_size,
        content_type: output.content_type.clone(),
    })
}

async fn download_all(byte_stream: &mut ByteStream, output: &mut Vec<u8>) -> std::io::Result<()> {
    output.clear();
    while let Some(chunk_res) = byte_stream.next().await {
        let chunk = chunk_res?;
        output.extend(chunk.as_ref());
    }
    Ok(())
}

#[async_trait]
impl ObjectStorage for S3CompatibleObjectStorage {
    async fn presigned_url(&self, bucket: &str, object_name: &str) -> S3Result<String> {
        let get_object_req = GetObjectRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            ..Default::default()
        };
        let url = get_object_req.get_presigned_url(
            &self.region,
            &self.credentials,
            &PreSignedRequestOption {
                expires_in: PRESIGNED_URL_EXPIRES,
            },
        );
        debug!(endpoint = %self.endpoint, object_name = %object_name, "Presigned URL created.");
        Ok(url)
    }

    async fn bucket_exists(&self, bucket: &str) -> S3Result<bool> {
        let head_bucket_req = HeadBucketRequest {
            bucket: bucket.to_string(),
            ..Default::default()
        };
        let head_bucket_res = with_backoff(&self.backoff, "head_bucket", || async {
            self.s3_client
                .head_bucket(head_bucket_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await;
        match head_bucket_res {
            Ok(()) => Ok(true),
            Err(RusotoErrorWrapper(RusotoError::Unknown(http_resp)))
                if http_resp.status == 404 =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn head_range(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> S3Result<RangeInfo> {
        let output = self
            .get_object_range(bucket, object_name, offset, len)
            .await?;
        range_info_from_output(&output)
    }

    async fn get_range(
        &self,
        bucket: &str,
        object_name: &str,
        offset: u64,
        len: u64,
    ) -> S3Result<Bytes> {
        let output = self
            .get_object_range(bucket, object_name, offset, len)
            .await?;
        let mut body = output.body.ok_or_else(|| {
            S3Error::failed(anyhow::anyhow!("Returned object body was empty."))
        })?;
        let mut buf: Vec<u8> = Vec::new();
        download_all(&mut body, &mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn create_multipart_upload<'a>(
        &self,
        bucket: &str,
        object_name: &str,
        content_type: Option<&'a str>,
    ) -> S3Result<String> {
        let create_upload_req = CreateMultipartUploadRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            content_type: content_type.map(ToString::to_string),
            ..Default::default()
        };
        let upload_id = with_backoff(&self.backoff, "create_multipart_upload", || async {
            self.s3_client
                .create_multipart_upload(create_upload_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(S3Error::from)?
        .upload_id
        .ok_or_else(|| {
            S3Error::failed(anyhow::anyhow!("The returned multipart upload id was null."))
        })?;
        Ok(upload_id)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
    ) -> S3Result<Vec<ObjectPart>> {
        let mut parts: Vec<ObjectPart> = Vec::new();
        let mut part_number_marker: Option<i64> = None;
        loop {
            let list_parts_req = ListPartsRequest {
                bucket: bucket.to_string(),
                key: object_name.to_string(),
                upload_id: upload_id.to_string(),
                part_number_marker,
                ..Default::default()
            };
            let list_parts_output = with_backoff(&self.backoff, "list_parts", || async {
                self.s3_client
                    .list_parts(list_parts_req.clone())
                    .await
                    .map_err(RusotoErrorWrapper::from)
            })
            .await
            .map_err(S3Error::from)?;
            for part in list_parts_output.parts.unwrap_or_default() {
                let (part_number, etag, size) = match (part.part_number, part.e_tag, part.size) {
                    (Some(part_number), Some(etag), Some(size)) => (part_number, etag, size),
                    _ => {
                        return Err(S3Error::failed(anyhow::anyhow!(
                            "ListParts returned an incomplete part descriptor."
                        )))
                    }
                };
                parts.push(ObjectPart {
                    part_number: part_number as u64,
                    etag,
                    size: size as u64,
                });
            }
            if list_parts_output.is_truncated != Some(true) {
                break;
            }
            part_number_marker = list_parts_output.next_part_number_marker;
        }
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
        part_number: u64,
        data: Bytes,
    ) -> S3Result<String> {
        let upload_part_output = with_backoff(&self.backoff, "upload_part", || async {
            let upload_part_req = UploadPartRequest {
                bucket: bucket.to_string(),
                key: object_name.to_string(),
                body: Some(ByteStream::from(data.to_vec())),
                content_length: Some(data.len() as i64),
                part_number: part_number as i64,
                upload_id: upload_id.to_string(),
                ..Default::default()
            };
            self.s3_client
                .upload_part(upload_part_req)
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(S3Error::from)?;
        upload_part_output.e_tag.ok_or_else(|| {
            S3Error::failed(anyhow::anyhow!("The uploaded part carried no etag."))
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
        parts: &[ObjectPart],
    ) -> S3Result<()> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|part| CompletedPart {
                e_tag: Some(part.etag.clone()),
                part_number: Some(part.part_number as i64),
            })
            .collect();
        let completed_upload = CompletedMultipartUpload {
            parts: Some(completed_parts),
        };
        let complete_upload_req = CompleteMultipartUploadRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            multipart_upload: Some(completed_upload),
            upload_id: upload_id.to_string(),
            ..Default::default()
        };
        with_backoff(&self.backoff, "complete_multipart_upload", || async {
            self.s3_client
                .complete_multipart_upload(complete_upload_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(S3Error::from)?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object_name: &str,
        upload_id: &str,
    ) -> S3Result<()> {
        let abort_upload_req = AbortMultipartUploadRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            upload_id: upload_id.to_string(),
            ..Default::default()
        };
        with_backoff(&self.backoff, "abort_multipart_upload", || async {
            self.s3_client
                .abort_multipart_upload(abort_upload_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(S3Error::from)?;
        Ok(())
    }

    async fn abort_all_multipart_uploads(&self, bucket: &str) -> S3Result<()> {
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;
        loop {
            let list_uploads_req = ListMultipartUploadsRequest {
                bucket: bucket.to_string(),
                key_marker: key_marker.clone(),
                upload_id_marker: upload_id_marker.clone(),
                ..Default::default()
            };
            let list_uploads_output =
                with_backoff(&self.backoff, "list_multipart_uploads", || async {
                    self.s3_client
                        .list_multipart_uploads(list_uploads_req.clone())
                        .await
                        .map_err(RusotoErrorWrapper::from)
                })
                .await
                .map_err(S3Error::from)?;
            let uploads = list_uploads_output.uploads.unwrap_or_default();
            if !uploads.is_empty() {
                info!(
                    endpoint = %self.endpoint,
                    num_uploads = uploads.len(),
                    "Aborting open multipart uploads."
                );
            }
            for upload in uploads {
                if let (Some(key), Some(upload_id)) = (upload.key, upload.upload_id) {
                    self.abort_multipart_upload(bucket, &key, &upload_id).await?;
                }
            }
            if list_uploads_output.is_truncated != Some(true) {
                break;
            }
            key_marker = list_uploads_output.next_key_marker;
            upload_id_marker = list_uploads_output.next_upload_id_marker;
        }
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, object_name: &str) -> S3Result<()> {
        let delete_object_req = DeleteObjectRequest {
            bucket: bucket.to_string(),
            key: object_name.to_string(),
            ..Default::default()
        };
        with_backoff(&self.backoff, "delete_object", || async {
            self.s3_client
                .delete_object(delete_object_req.clone())
                .await
                .map_err(RusotoErrorWrapper::from)
        })
        .await
        .map_err(S3Error::from)?;
        Ok(())
    }
}

/// Builds one S3 client per node endpoint and reuses it across requests:
/// each client is internally connection-pooled.
#[derive(Default)]
pub struct S3ObjectStorageFactory {
    clients: Mutex<HashMap<String, Arc<S3CompatibleObjectStorage>>>,
}

impl ObjectStorageFactory for S3ObjectStorageFactory {
    fn for_node(&self, node: &Node) -> S3Result<Arc<dyn ObjectStorage>> {
        let mut clients = self.clients.lock().expect("lock poisoned");
        if let Some(storage) = clients.get(&node.endpoint) {
            return Ok(storage.clone());
        }
        let storage = Arc::new(
            S3CompatibleObjectStorage::for_node(node).map_err(S3Error::failed)?,
        );
        clients.insert(node.endpoint.clone(), storage.clone());
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_total_size, S3CompatibleObjectStorage};

    #[test]
    fn test_parse_total_size() {
        assert_eq!(parse_total_size("bytes 0-0/1048576"), Some(1048576));
        assert_eq!(parse_total_size("bytes 5-10/42"), Some(42));
        assert_eq!(parse_total_size("bytes 0-0/*"), None);
        assert_eq!(parse_total_size("1048576"), None);
    }

    #[test]
    fn test_endpoint_normalization() {
        let storage =
            S3CompatibleObjectStorage::new("http://edge-a.filmcdn.local:9000/", "key", "secret")
                .unwrap();
        assert_eq!(
            format!("{:?}", storage),
            "S3CompatibleObjectStorage(endpoint=http://edge-a.filmcdn.local:9000)"
        );
    }
}
