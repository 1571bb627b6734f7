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

//! End-to-end scenarios over the placement engine and the replication
//! scheduler, with mocked object stores and an in-RAM cache.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use filmcdn_cdn::{
    record_key, unix_now, CdnError, Collection, CopyJob, MockGeoLocator, MockReplicationQueue,
    MultipartUploader, PlacementEngine, ReplicationQueue, ReplicationScheduler, UploadRecord,
    UploadStatus,
};
use filmcdn_config::{Node, NodeRegistry};
use filmcdn_storage::{
    Cache, MockObjectStorage, ObjectStorage, ObjectStorageFactory, RamCache, RangeInfo, S3Error,
    S3Result,
};
use tempfile::NamedTempFile;

const BUCKET: &str = "movies";
const PART_SIZE: u64 = 6 * 1024 * 1024;

const NODES_JSON: &str = r#"{
    "ORIGIN": {
        "endpoint": "origin.filmcdn.local:9000",
        "alias": "origin",
        "access_key_id": "origin-access",
        "secret_access_key": "origin-secret",
        "city": "Amsterdam",
        "latitude": 52.37,
        "longitude": 4.89,
        "is_active": "True"
    },
    "EDGE_A": {
        "endpoint": "edge-a.filmcdn.local:9000",
        "alias": "edge-a",
        "access_key_id": "edge-access",
        "secret_access_key": "edge-secret",
        "city": "New York",
        "latitude": 40.0,
        "longitude": -74.0,
        "is_active": "True"
    }
}"#;

const ORIGIN_URL: &str = "http://origin.filmcdn.local:9000";
const EDGE_URL: &str = "http://edge-a.filmcdn.local:9000";

/// Routes each node endpoint to its mocked store.
struct StaticStorageFactory {
    storages: HashMap<String, Arc<dyn ObjectStorage>>,
}

impl StaticStorageFactory {
    fn new(storages: Vec<(&str, Arc<dyn ObjectStorage>)>) -> StaticStorageFactory {
        StaticStorageFactory {
            storages: storages
                .into_iter()
                .map(|(endpoint, storage)| (endpoint.to_string(), storage))
                .collect(),
        }
    }
}

impl ObjectStorageFactory for StaticStorageFactory {
    fn for_node(&self, node: &Node) -> S3Result<Arc<dyn ObjectStorage>> {
        Ok(self
            .storages
            .get(&node.endpoint)
            .unwrap_or_else(|| panic!("no mock registered for `{}`", node.endpoint))
            .clone())
    }
}

fn write_nodes_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(NODES_JSON.as_bytes()).unwrap();
    file
}

fn near_new_york() -> MockGeoLocator {
    let mut geo_locator = MockGeoLocator::new();
    geo_locator.expect_locate().returning(|_| {
        Some(filmcdn_cdn::GeoPoint {
            latitude: 41.0,
            longitude: -73.0,
        })
    });
    geo_locator
}

fn not_found_error() -> S3Error {
    S3Error::NotFound {
        source: anyhow::anyhow!("NoSuchKey"),
    }
}

/// Cold GET: the object only exists on the origin. The client is redirected
/// to the origin and a copy towards its closest edge is scheduled.
#[tokio::test]
async fn test_cold_get_serves_origin_and_schedules_replication() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());

    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));

    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_bucket_exists().returning(|_| Ok(true));
    origin_storage.expect_head_range().returning(|_, _, _, _| {
        Ok(RangeInfo {
            content_length: 1,
            total_size: 1024,
            content_type: Some("video/mp4".to_string()),
        })
    });
    origin_storage
        .expect_presigned_url()
        .returning(|_, object_name| {
            Ok(format!("{}/{}/{}?signed", ORIGIN_URL, BUCKET, object_name))
        });

    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));

    let mut queue = MockReplicationQueue::new();
    queue
        .expect_enqueue_copy()
        .withf(|job: &CopyJob| {
            job.object_name == "movie.mp4"
                && job.edge.alias == "edge-a"
                && job.status == UploadStatus::InProgress
        })
        .times(1)
        .returning(|_| true);

    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(near_new_york()),
        cache.clone(),
        factory,
        Arc::new(queue),
        BUCKET,
    );

    let url = engine.resolve_url("203.0.113.7", "movie.mp4").await.unwrap();
    assert!(url.starts_with(ORIGIN_URL));
}

/// Once the edge holds the object, the same request is served straight from
/// the edge and nothing is enqueued.
#[tokio::test]
async fn test_warm_get_serves_edge() {
    let nodes_file = write_nodes_file();
    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage.expect_head_range().returning(|_, _, _, _| {
        Ok(RangeInfo {
            content_length: 1,
            total_size: 1024,
            content_type: Some("video/mp4".to_string()),
        })
    });
    edge_storage
        .expect_presigned_url()
        .returning(|_, object_name| {
            Ok(format!("{}/{}/{}?signed", EDGE_URL, BUCKET, object_name))
        });
    let origin_storage = MockObjectStorage::new();

    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);

    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(near_new_york()),
        Arc::new(RamCache::new()),
        factory,
        Arc::new(queue),
        BUCKET,
    );
    let url = engine.resolve_url("203.0.113.7", "movie.mp4").await.unwrap();
    assert!(url.starts_with(EDGE_URL));
}

/// A `scheduler_in_progress` record suppresses a second enqueue: concurrent
/// GETs of the same missing object yield exactly one replication job.
#[tokio::test]
async fn test_single_flight_suppresses_duplicate_enqueue() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    let reconciling = UploadRecord {
        mpu_id: "mpu-1".to_string(),
        part_number: 1,
        etag: "\"etag\"".to_string(),
        uploaded: PART_SIZE,
        size: 4 * PART_SIZE,
        last_modified: unix_now(),
        status: UploadStatus::SchedulerInProgress,
    };
    reconciling
        .store(
            cache.as_ref() as &dyn Cache,
            &record_key(Collection::Cdn, "movie.mp4", EDGE_URL),
        )
        .await
        .unwrap();

    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));
    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_bucket_exists().returning(|_| Ok(true));
    origin_storage.expect_head_range().returning(|_, _, _, _| {
        Ok(RangeInfo {
            content_length: 1,
            total_size: 4 * PART_SIZE,
            content_type: None,
        })
    });
    origin_storage
        .expect_presigned_url()
        .returning(|_, _| Ok(format!("{}/signed", ORIGIN_URL)));

    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);

    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(near_new_york()),
        cache,
        factory,
        Arc::new(queue),
        BUCKET,
    );
    engine.resolve_url("203.0.113.7", "movie.mp4").await.unwrap();
}

/// The object exists nowhere: placement fails with object-not-found.
#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    let nodes_file = write_nodes_file();
    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));
    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_bucket_exists().returning(|_| Ok(true));
    origin_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));

    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);

    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(near_new_york()),
        Arc::new(RamCache::new()),
        factory,
        Arc::new(queue),
        BUCKET,
    );
    let resolve_err = engine
        .resolve_url("203.0.113.7", "movie.mp4")
        .await
        .unwrap_err();
    assert!(matches!(resolve_err, CdnError::ObjectNotFound { .. }));
}

fn replication_mocks(total_size: u64) -> (Arc<dyn ObjectStorage>, Arc<dyn ObjectStorage>) {
    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_head_range().returning(move |_, _, _, _| {
        Ok(RangeInfo {
            content_length: 1,
            total_size,
            content_type: Some("video/mp4".to_string()),
        })
    });
    origin_storage
        .expect_get_range()
        .returning(|_, _, _, len| Ok(Bytes::from(vec![0u8; len as usize])));

    let mut edge_storage = MockObjectStorage::new();
    edge_storage
        .expect_create_multipart_upload()
        .returning(|_, _, _| Ok("mpu-edge".to_string()));
    edge_storage
        .expect_upload_part()
        .returning(|_, _, _, part_number, _| Ok(format!("\"etag-{}\"", part_number)));
    edge_storage
        .expect_complete_multipart_upload()
        .returning(|_, _, _, _| Ok(()));
    (
        Arc::new(origin_storage) as Arc<dyn ObjectStorage>,
        Arc::new(edge_storage) as Arc<dyn ObjectStorage>,
    )
}

fn scheduler_with(
    nodes_file: &NamedTempFile,
    cache: Arc<RamCache>,
    origin_storage: Arc<dyn ObjectStorage>,
    edge_storage: Arc<dyn ObjectStorage>,
) -> ReplicationScheduler {
    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", origin_storage),
        ("edge-a.filmcdn.local:9000", edge_storage),
    ]));
    ReplicationScheduler::new(
        NodeRegistry::new(nodes_file.path()),
        cache.clone(),
        factory,
        MultipartUploader::new(cache, PART_SIZE),
        BUCKET,
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    )
}

async fn await_finished(cache: &RamCache, key: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = UploadRecord::fetch(cache, key).await.unwrap() {
                if record.status == UploadStatus::Finished {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replication did not finish in time");
}

/// An enqueued copy job runs to completion and commits a `finished` record
/// for the edge.
#[tokio::test]
async fn test_enqueued_copy_reaches_finished() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    let (origin_storage, edge_storage) = replication_mocks(PART_SIZE + 1);
    let scheduler = scheduler_with(&nodes_file, cache.clone(), origin_storage, edge_storage);
    scheduler.start().await;
    // A second start is tolerated.
    scheduler.start().await;

    let nodes = NodeRegistry::new(nodes_file.path()).active_nodes().await.unwrap();
    let enqueued = scheduler.enqueue_copy(CopyJob {
        object_name: "movie.mp4".to_string(),
        origin: nodes.origin().unwrap().clone(),
        edge: nodes.get("EDGE_A").unwrap().clone(),
        status: UploadStatus::InProgress,
    });
    assert!(enqueued);

    let key = record_key(Collection::Cdn, "movie.mp4", EDGE_URL);
    await_finished(&cache, &key).await;
    let record = UploadRecord::fetch(cache.as_ref(), &key).await.unwrap().unwrap();
    assert_eq!(record.uploaded, PART_SIZE + 1);
    assert_eq!(record.size, PART_SIZE + 1);
}

/// The finish sweep re-enqueues a recently interrupted replication with the
/// `scheduler_in_progress` label and drives it to completion.
#[tokio::test]
async fn test_finish_sweep_resumes_recent_uploads() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    let key = record_key(Collection::Cdn, "movie.mp4", EDGE_URL);
    let interrupted = UploadRecord {
        mpu_id: "mpu-edge".to_string(),
        part_number: 0,
        etag: String::new(),
        uploaded: 0,
        size: PART_SIZE + 1,
        last_modified: unix_now() - 60,
        status: UploadStatus::InProgress,
    };
    interrupted
        .store(cache.as_ref() as &dyn Cache, &key)
        .await
        .unwrap();

    let (origin_storage, edge_storage) = {
        let mut origin_storage = MockObjectStorage::new();
        origin_storage.expect_head_range().returning(|_, _, _, _| {
            Ok(RangeInfo {
                content_length: 1,
                total_size: PART_SIZE + 1,
                content_type: None,
            })
        });
        origin_storage
            .expect_get_range()
            .returning(|_, _, _, len| Ok(Bytes::from(vec![0u8; len as usize])));
        let mut edge_storage = MockObjectStorage::new();
        // The record carries an mpu id: the engine resumes instead of
        // creating a new upload.
        edge_storage.expect_create_multipart_upload().times(0);
        edge_storage
            .expect_list_parts()
            .returning(|_, _, _| Ok(Vec::new()));
        edge_storage
            .expect_upload_part()
            .returning(|_, _, _, part_number, _| Ok(format!("\"etag-{}\"", part_number)));
        edge_storage
            .expect_complete_multipart_upload()
            .returning(|_, _, _, _| Ok(()));
        (
            Arc::new(origin_storage) as Arc<dyn ObjectStorage>,
            Arc::new(edge_storage) as Arc<dyn ObjectStorage>,
        )
    };
    let scheduler = scheduler_with(&nodes_file, cache.clone(), origin_storage, edge_storage);
    scheduler.start().await;
    scheduler.finish_in_progress().await.unwrap();
    await_finished(&cache, &key).await;
}

/// Stale abort: an upload untouched for 7 hours is aborted on its node and
/// its record deleted. A fresh record on another key survives.
#[tokio::test]
async fn test_abort_sweep_drops_stale_uploads() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    let stale_key = record_key(Collection::Api, "foo", ORIGIN_URL);
    let stale = UploadRecord {
        mpu_id: "mpu-stale".to_string(),
        part_number: 2,
        etag: "\"etag\"".to_string(),
        uploaded: 2 * PART_SIZE,
        size: 4 * PART_SIZE,
        last_modified: unix_now() - 7 * 3600,
        status: UploadStatus::InProgress,
    };
    stale
        .store(cache.as_ref() as &dyn Cache, &stale_key)
        .await
        .unwrap();
    let fresh_key = record_key(Collection::Cdn, "bar", EDGE_URL);
    let fresh = UploadRecord {
        last_modified: unix_now(),
        ..stale.clone()
    };
    fresh
        .store(cache.as_ref() as &dyn Cache, &fresh_key)
        .await
        .unwrap();

    let mut origin_storage = MockObjectStorage::new();
    origin_storage
        .expect_abort_multipart_upload()
        .withf(|_, object_name, upload_id| object_name == "foo" && upload_id == "mpu-stale")
        .times(1)
        .returning(|_, _, _| Ok(()));
    let edge_storage = MockObjectStorage::new();

    let scheduler = scheduler_with(
        &nodes_file,
        cache.clone(),
        Arc::new(origin_storage),
        Arc::new(edge_storage),
    );
    scheduler.abort_stale().await.unwrap();

    assert!(UploadRecord::fetch(cache.as_ref(), &stale_key)
        .await
        .unwrap()
        .is_none());
    assert!(UploadRecord::fetch(cache.as_ref(), &fresh_key)
        .await
        .unwrap()
        .is_some());
}

/// Delete across nodes: the object disappears from every node holding it
/// and both upload records per node are erased.
#[tokio::test]
async fn test_delete_everywhere() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    for (collection, node_url) in [
        (Collection::Api, ORIGIN_URL),
        (Collection::Cdn, EDGE_URL),
    ] {
        cache
            .hash_set(
                &record_key(collection, "pic.jpg", node_url),
                &[("status".to_string(), "finished".to_string())],
            )
            .await
            .unwrap();
    }

    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_bucket_exists().returning(|_| Ok(true));
    origin_storage
        .expect_head_range()
        .returning(|_, _, _, _| {
            Ok(RangeInfo {
                content_length: 1,
                total_size: 1024,
                content_type: None,
            })
        });
    origin_storage
        .expect_delete_object()
        .times(1)
        .returning(|_, _| Ok(()));
    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage.expect_head_range().returning(|_, _, _, _| {
        Ok(RangeInfo {
            content_length: 1,
            total_size: 1024,
            content_type: None,
        })
    });
    edge_storage
        .expect_delete_object()
        .times(1)
        .returning(|_, _| Ok(()));

    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);
    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(MockGeoLocator::new()),
        cache.clone(),
        factory,
        Arc::new(queue),
        BUCKET,
    );

    let mut deleted_from = engine.delete_everywhere("pic.jpg").await.unwrap();
    deleted_from.sort();
    assert_eq!(deleted_from, vec![EDGE_URL.to_string(), ORIGIN_URL.to_string()]);
    assert!(cache
        .hash_get_all(&record_key(Collection::Api, "pic.jpg", ORIGIN_URL))
        .await
        .unwrap()
        .is_none());
    assert!(cache
        .hash_get_all(&record_key(Collection::Cdn, "pic.jpg", EDGE_URL))
        .await
        .unwrap()
        .is_none());

    // A second delete finds the object nowhere.
    let mut origin_storage = MockObjectStorage::new();
    origin_storage.expect_bucket_exists().returning(|_| Ok(true));
    origin_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));
    let mut edge_storage = MockObjectStorage::new();
    edge_storage.expect_bucket_exists().returning(|_| Ok(true));
    edge_storage
        .expect_head_range()
        .returning(|_, _, _, _| Err(not_found_error()));
    let factory = Arc::new(StaticStorageFactory::new(vec![
        ("origin.filmcdn.local:9000", Arc::new(origin_storage) as Arc<dyn ObjectStorage>),
        ("edge-a.filmcdn.local:9000", Arc::new(edge_storage) as Arc<dyn ObjectStorage>),
    ]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);
    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(MockGeoLocator::new()),
        cache,
        factory,
        Arc::new(queue),
        BUCKET,
    );
    let delete_err = engine.delete_everywhere("pic.jpg").await.unwrap_err();
    assert!(matches!(delete_err, CdnError::ObjectNotFound { .. }));
}

/// Status lookup reads the origin's ingest record.
#[tokio::test]
async fn test_origin_status() {
    let nodes_file = write_nodes_file();
    let cache = Arc::new(RamCache::new());
    cache
        .hash_set(
            &record_key(Collection::Api, "movie.mp4", ORIGIN_URL),
            &[("status".to_string(), "in_progress".to_string())],
        )
        .await
        .unwrap();
    let factory = Arc::new(StaticStorageFactory::new(vec![]));
    let mut queue = MockReplicationQueue::new();
    queue.expect_enqueue_copy().times(0);
    let engine = PlacementEngine::new(
        NodeRegistry::new(nodes_file.path()),
        Arc::new(MockGeoLocator::new()),
        cache,
        factory,
        Arc::new(queue),
        BUCKET,
    );
    let status = engine.origin_status("movie.mp4").await.unwrap().unwrap();
    assert_eq!(
        status,
        format!(
            "'movie.mp4' has status 'in_progress' on node '{}'",
            ORIGIN_URL
        )
    );
    assert!(engine.origin_status("other.mp4").await.unwrap().is_none());
}
