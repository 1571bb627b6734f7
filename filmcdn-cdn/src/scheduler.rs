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

//! Background origin→edge replication.
//!
//! One process-wide scheduler owns a job queue drained by a small worker
//! pool. Two periodic sweeps reconcile interrupted work: recently touched
//! uploads are driven to completion, uploads untouched for longer than the
//! staleness threshold are aborted and forgotten.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filmcdn_config::{Node, NodeRegistry};
use filmcdn_storage::{Cache, ObjectStorageFactory};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{object_name_from_key, record_key, unix_now, Collection, UploadRecord, UploadStatus};
use crate::multipart::{MultipartUploader, RangedGetChunkSource};
use crate::{CdnError, CdnResult};

/// Uploads untouched for longer than this are considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Replication is I/O bound on two stores at once; a couple of workers keep
/// the edges warm without starving client traffic.
const SCHEDULER_WORKERS: usize = 2;

/// One origin→edge copy of a single object.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub object_name: String,
    pub origin: Node,
    pub edge: Node,
    /// Status label written to the upload record while the copy runs.
    pub status: UploadStatus,
}

/// The narrow scheduler surface the placement engine depends on.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
pub trait ReplicationQueue: Send + Sync + 'static {
    /// Enqueues a copy job. Returns false when the scheduler is gone;
    /// callers treat that as a log-and-continue condition.
    fn enqueue_copy(&self, job: CopyJob) -> bool;
}

struct SchedulerInner {
    registry: NodeRegistry,
    cache: Arc<dyn Cache>,
    storages: Arc<dyn ObjectStorageFactory>,
    uploader: MultipartUploader,
    bucket: String,
    finish_sweep_interval: Duration,
    abort_sweep_interval: Duration,
    job_sender: mpsc::UnboundedSender<CopyJob>,
    job_receiver: Mutex<Option<mpsc::UnboundedReceiver<CopyJob>>>,
    started: AtomicBool,
}

/// Process-wide replication scheduler.
#[derive(Clone)]
pub struct ReplicationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ReplicationScheduler {
    pub fn new(
        registry: NodeRegistry,
        cache: Arc<dyn Cache>,
        storages: Arc<dyn ObjectStorageFactory>,
        uploader: MultipartUploader,
        bucket: impl Into<String>,
        finish_sweep_interval: Duration,
        abort_sweep_interval: Duration,
    ) -> ReplicationScheduler {
        let (job_sender, job_receiver) = mpsc::unbounded_channel();
        ReplicationScheduler {
            inner: Arc::new(SchedulerInner {
                registry,
                cache,
                storages,
                uploader,
                bucket: bucket.into(),
                finish_sweep_interval,
                abort_sweep_interval,
                job_sender,
                job_receiver: Mutex::new(Some(job_receiver)),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the worker pool and the periodic sweeps. Starting twice is
    /// tolerated: later calls are no-ops.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            info!("Replication scheduler is already running.");
            return;
        }
        let receiver = self
            .inner
            .job_receiver
            .lock()
            .await
            .take()
            .map(|receiver| Arc::new(Mutex::new(receiver)));
        let receiver = match receiver {
            Some(receiver) => receiver,
            None => return,
        };
        for worker_id in 0..SCHEDULER_WORKERS {
            let scheduler = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job_opt = receiver.lock().await.recv().await;
                    let job = match job_opt {
                        Some(job) => job,
                        None => break,
                    };
                    if let Err(err) = scheduler.run_copy_job(&job).await {
                        warn!(
                            worker_id = worker_id,
                            object_name = %job.object_name,
                            edge = %job.edge.endpoint,
                            error = %err,
                            "Replication job failed; the periodic sweep will retry."
                        );
                    }
                }
            });
        }
        self.spawn_sweep(self.inner.finish_sweep_interval, SweepKind::Finish);
        self.spawn_sweep(self.inner.abort_sweep_interval, SweepKind::Abort);
        info!("Replication scheduler started.");
    }

    fn spawn_sweep(&self, period: Duration, kind: SweepKind) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so sweeps only run
            // after one full period.
            interval.tick().await;
            loop {
                interval.tick().await;
                let sweep_res = match kind {
                    SweepKind::Finish => scheduler.finish_in_progress().await,
                    SweepKind::Abort => scheduler.abort_stale().await,
                };
                if let Err(err) = sweep_res {
                    warn!(kind = ?kind, error = %err, "Periodic sweep failed.");
                }
            }
        });
    }

    /// Runs one copy job: re-checks the record, learns the object size from
    /// the origin, then streams it to the edge part by part.
    async fn run_copy_job(&self, job: &CopyJob) -> CdnResult<()> {
        let inner = &self.inner;
        let edge_url = job.edge.url();
        let cdn_key = record_key(Collection::Cdn, &job.object_name, &edge_url);
        if let Some(record) = UploadRecord::fetch(inner.cache.as_ref(), &cdn_key).await? {
            if record.status == UploadStatus::Finished {
                info!(
                    object_name = %job.object_name,
                    edge = %job.edge.endpoint,
                    "Object was copied while the job sat in the queue."
                );
                return Ok(());
            }
        }
        let origin_storage = inner.storages.for_node(&job.origin)?;
        let edge_storage = inner.storages.for_node(&job.edge)?;
        let range_info = origin_storage
            .head_range(&inner.bucket, &job.object_name, 0, 1)
            .await?;
        info!(
            object_name = %job.object_name,
            from = %job.origin.endpoint,
            to = %job.edge.endpoint,
            total_size = range_info.total_size,
            "Uploading object to the edge location."
        );
        let mut source = RangedGetChunkSource::new(
            origin_storage,
            inner.bucket.clone(),
            job.object_name.clone(),
            range_info.total_size,
            inner.uploader.part_size(),
        );
        let upload_res = inner
            .uploader
            .upload(
                edge_storage.as_ref(),
                &inner.bucket,
                &job.object_name,
                range_info.content_type.as_deref(),
                range_info.total_size,
                &mut source,
                Collection::Cdn,
                job.status,
                &edge_url,
            )
            .await;
        match upload_res {
            Err(CdnError::AlreadyUploaded { .. }) => {
                info!(
                    object_name = %job.object_name,
                    edge = %job.edge.endpoint,
                    "Object already finished on the edge."
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Re-enqueues every recently touched unfinished replication, so that
    /// interrupted copies converge to `finished`. Idempotent: a completed
    /// record is skipped, a running one is re-checked by the job itself.
    pub async fn finish_in_progress(&self) -> CdnResult<()> {
        let inner = &self.inner;
        let nodes = inner.registry.active_nodes().await?;
        let origin = nodes.origin()?.clone();
        let stale_floor = unix_now() - STALE_AFTER.as_secs() as i64;
        for edge in nodes.edges() {
            let edge_url = edge.url();
            let pattern = format!("{}^*^{}", Collection::Cdn, edge_url);
            for key in inner.cache.keys_matching(&pattern).await? {
                let record = match UploadRecord::fetch(inner.cache.as_ref(), &key).await? {
                    Some(record) => record,
                    None => continue,
                };
                if !record.status.is_in_progress() || record.last_modified <= stale_floor {
                    continue;
                }
                let object_name = match object_name_from_key(&key) {
                    Some(object_name) => object_name.to_string(),
                    None => {
                        warn!(key = %key, "Skipping a malformed upload record key.");
                        continue;
                    }
                };
                info!(
                    object_name = %object_name,
                    edge = %edge.endpoint,
                    "Resuming an interrupted replication."
                );
                self.enqueue_copy(CopyJob {
                    object_name,
                    origin: origin.clone(),
                    edge: edge.clone(),
                    status: UploadStatus::SchedulerInProgress,
                });
            }
        }
        Ok(())
    }

    /// Aborts every upload untouched for longer than [`STALE_AFTER`] and
    /// deletes its record, on every active node and for both collections.
    pub async fn abort_stale(&self) -> CdnResult<()> {
        let inner = &self.inner;
        let nodes = inner.registry.active_nodes().await?;
        let stale_floor = unix_now() - STALE_AFTER.as_secs() as i64;
        for node in nodes.iter() {
            let node_url = node.url();
            let pattern = format!("*^*^{}", node_url);
            for key in inner.cache.keys_matching(&pattern).await? {
                let record = match UploadRecord::fetch(inner.cache.as_ref(), &key).await? {
                    Some(record) => record,
                    None => continue,
                };
                if !record.status.is_in_progress() || record.last_modified >= stale_floor {
                    continue;
                }
                let object_name = match object_name_from_key(&key) {
                    Some(object_name) => object_name.to_string(),
                    None => {
                        warn!(key = %key, "Skipping a malformed upload record key.");
                        continue;
                    }
                };
                if !record.mpu_id.is_empty() {
                    let storage = inner.storages.for_node(node)?;
                    let abort_res = storage
                        .abort_multipart_upload(&inner.bucket, &object_name, &record.mpu_id)
                        .await;
                    match abort_res {
                        Ok(()) => {}
                        // The store no longer knows the upload: the record
                        // is all that is left to clean up.
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            warn!(
                                object_name = %object_name,
                                node = %node.endpoint,
                                error = %err,
                                "Failed to abort a stale upload; keeping its record for the next sweep."
                            );
                            continue;
                        }
                    }
                }
                inner.cache.delete(&key).await?;
                info!(
                    object_name = %object_name,
                    node = %node.endpoint,
                    "Aborted a stale upload."
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Finish,
    Abort,
}

impl ReplicationQueue for ReplicationScheduler {
    fn enqueue_copy(&self, job: CopyJob) -> bool {
        self.inner.job_sender.send(job).is_ok()
    }
}
