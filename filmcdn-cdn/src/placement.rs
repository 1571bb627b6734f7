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

//! Object placement: which node's credentials mint the redirect URL.

use std::sync::Arc;

use filmcdn_config::{Node, NodeRegistry};
use filmcdn_storage::{Cache, ObjectStorageFactory};
use tracing::{info, warn};

use crate::geo::{find_closest_node, GeoLocator};
use crate::model::{record_key, Collection, UploadRecord, UploadStatus};
use crate::scheduler::{CopyJob, ReplicationQueue};
use crate::{CdnError, CdnResult};

/// The node whose endpoint and credentials serve the request.
#[derive(Debug, Clone)]
pub struct Placement {
    pub node: Node,
}

/// Decides where a requested object is served from, schedules replication
/// towards the client's closest edge, and owns the delete-everywhere and
/// status lookups.
pub struct PlacementEngine {
    registry: NodeRegistry,
    geo_locator: Arc<dyn GeoLocator>,
    cache: Arc<dyn Cache>,
    storages: Arc<dyn ObjectStorageFactory>,
    replication: Arc<dyn ReplicationQueue>,
    bucket: String,
}

impl PlacementEngine {
    pub fn new(
        registry: NodeRegistry,
        geo_locator: Arc<dyn GeoLocator>,
        cache: Arc<dyn Cache>,
        storages: Arc<dyn ObjectStorageFactory>,
        replication: Arc<dyn ReplicationQueue>,
        bucket: impl Into<String>,
    ) -> PlacementEngine {
        PlacementEngine {
            registry,
            geo_locator,
            cache,
            storages,
            replication,
            bucket: bucket.into(),
        }
    }

    /// Resolves the node serving `object_name` for a client at `client_ip`.
    ///
    /// The closest edge serves the object when it holds it. When it does
    /// not, the origin serves the request and a background copy towards
    /// that edge is scheduled, unless one is already being reconciled.
    /// Clients therefore never receive a URL that 404s.
    pub async fn resolve(&self, client_ip: &str, object_name: &str) -> CdnResult<Placement> {
        let nodes = self.registry.active_nodes().await?;
        let origin = nodes.origin()?.clone();
        let closest = match find_closest_node(self.geo_locator.as_ref(), client_ip, &nodes).await
        {
            Some(node) => node,
            None => {
                info!(origin = %origin.endpoint, "Use Origin S3");
                origin.clone()
            }
        };

        let exists_on_closest = if closest.is_origin() {
            self.probe(&closest, object_name).await?
        } else {
            // An unreachable edge is served around, not surfaced.
            match self.probe(&closest, object_name).await {
                Ok(exists) => exists,
                Err(err) => {
                    warn!(
                        edge = %closest.endpoint,
                        error = %err,
                        "Edge probe failed; treating the object as absent there."
                    );
                    false
                }
            }
        };
        if exists_on_closest {
            return Ok(Placement { node: closest });
        }
        if closest.is_origin() {
            return Err(self.object_not_found(object_name));
        }

        if !self.probe(&origin, object_name).await? {
            // Nothing to be copied.
            return Err(self.object_not_found(object_name));
        }
        self.schedule_replication(object_name, &origin, &closest)
            .await;
        // Origin credentials until the copy lands on the edge.
        Ok(Placement { node: origin })
    }

    /// Resolves and mints the presigned redirect URL in one step.
    pub async fn resolve_url(&self, client_ip: &str, object_name: &str) -> CdnResult<String> {
        let placement = self.resolve(client_ip, object_name).await?;
        let storage = self.storages.for_node(&placement.node)?;
        let url = storage.presigned_url(&self.bucket, object_name).await?;
        info!(endpoint = %placement.node.endpoint, "URL created");
        Ok(url)
    }

    /// Removes `object_name` from every active node holding it and erases
    /// its upload records. Returns the node URLs deleted from.
    pub async fn delete_everywhere(&self, object_name: &str) -> CdnResult<Vec<String>> {
        let nodes = self.registry.active_nodes().await?;
        let mut deleted_from: Vec<String> = Vec::new();
        for node in nodes.iter() {
            let exists = match self.probe(node, object_name).await {
                Ok(exists) => exists,
                Err(err) => {
                    warn!(node = %node.endpoint, error = %err, "Probe failed during delete.");
                    false
                }
            };
            if !exists {
                info!(
                    object_name = %object_name,
                    node = %node.endpoint,
                    "Object is not present on the node."
                );
                continue;
            }
            let storage = self.storages.for_node(node)?;
            storage.delete_object(&self.bucket, object_name).await?;
            let node_url = node.url();
            for collection in [Collection::Api, Collection::Cdn] {
                self.cache
                    .delete(&record_key(collection, object_name, &node_url))
                    .await?;
            }
            info!(object_name = %object_name, node = %node.endpoint, "Object removed.");
            deleted_from.push(node_url);
        }
        if deleted_from.is_empty() {
            return Err(self.object_not_found(object_name));
        }
        Ok(deleted_from)
    }

    /// Human-readable status of the client ingest for `object_name`, read
    /// from the origin's upload record. `None` when no upload is known.
    pub async fn origin_status(&self, object_name: &str) -> CdnResult<Option<String>> {
        let nodes = self.registry.active_nodes().await?;
        let origin_url = nodes.origin()?.url();
        let key = record_key(Collection::Api, object_name, &origin_url);
        let record = UploadRecord::fetch(self.cache.as_ref(), &key).await?;
        Ok(record.map(|record| {
            format!(
                "'{}' has status '{}' on node '{}'",
                object_name, record.status, origin_url
            )
        }))
    }

    /// The object is present when the bucket exists and a 1-byte ranged GET
    /// succeeds.
    async fn probe(&self, node: &Node, object_name: &str) -> CdnResult<bool> {
        let storage = self.storages.for_node(node)?;
        if !storage.bucket_exists(&self.bucket).await? {
            return Ok(false);
        }
        match storage.head_range(&self.bucket, object_name, 0, 1).await {
            Ok(_) => {
                info!(
                    object_name = %object_name,
                    node = %node.endpoint,
                    "Found object on node."
                );
                Ok(true)
            }
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Best-effort: replication failures are repaired by later requests and
    /// the periodic sweeps, so they are logged and swallowed.
    async fn schedule_replication(&self, object_name: &str, origin: &Node, edge: &Node) {
        let cdn_key = record_key(Collection::Cdn, object_name, &edge.url());
        let reconciling = match UploadRecord::fetch(self.cache.as_ref(), &cdn_key).await {
            Ok(Some(record)) => record.status == UploadStatus::SchedulerInProgress,
            Ok(None) => false,
            Err(err) => {
                warn!(key = %cdn_key, error = %err, "Single-flight check failed.");
                false
            }
        };
        if reconciling {
            info!(
                object_name = %object_name,
                edge = %edge.endpoint,
                "Replication already owned by the scheduler."
            );
            return;
        }
        let enqueued = self.replication.enqueue_copy(CopyJob {
            object_name: object_name.to_string(),
            origin: origin.clone(),
            edge: edge.clone(),
            status: UploadStatus::InProgress,
        });
        if enqueued {
            info!(
                object_name = %object_name,
                edge = %edge.endpoint,
                "Scheduled a copy from the origin."
            );
        } else {
            warn!(
                object_name = %object_name,
                edge = %edge.endpoint,
                "Failed to schedule replication; a later request will retry."
            );
        }
    }

    fn object_not_found(&self, object_name: &str) -> CdnError {
        let not_found = CdnError::ObjectNotFound {
            object_name: object_name.to_string(),
            bucket: self.bucket.clone(),
        };
        warn!("{}", not_found);
        not_found
    }
}
