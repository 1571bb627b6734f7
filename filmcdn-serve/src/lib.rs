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

//! REST front of the CDN: wires the engines together at startup and
//! translates `/api/v1/films` routes into core operations.

mod error;
mod rate_limit;
mod rest;

use std::sync::Arc;

use filmcdn_cdn::{
    GeoLocator, IpapiGeoLocator, MultipartUploader, PlacementEngine, ReplicationScheduler,
};
use filmcdn_common::resolve_bind_addr;
use filmcdn_config::{NodeRegistry, Settings};
use filmcdn_storage::{Cache, ObjectStorageFactory, RedisCache, S3ObjectStorageFactory};
use tracing::info;
use warp::Filter;

pub use crate::error::ApiError;
pub use crate::rate_limit::rate_limit;
pub use crate::rest::{cdn_api_handlers, recover_fn};

/// Everything a request handler needs, built once at startup and shared.
pub struct AppContext {
    pub settings: Settings,
    pub registry: NodeRegistry,
    pub cache: Arc<dyn Cache>,
    pub storages: Arc<dyn ObjectStorageFactory>,
    pub placement: PlacementEngine,
    pub uploader: MultipartUploader,
}

/// Builds the application context and runs the REST service until ctrl-c.
pub async fn serve_cli(settings: Settings) -> anyhow::Result<()> {
    let cache: Arc<dyn Cache> =
        Arc::new(RedisCache::connect(&settings.redis_host, settings.redis_port).await?);
    let storages: Arc<dyn ObjectStorageFactory> = Arc::new(S3ObjectStorageFactory::default());
    let geo_locator: Arc<dyn GeoLocator> =
        Arc::new(IpapiGeoLocator::new(settings.ipapi_key.as_str())?);
    let registry = NodeRegistry::new(settings.nodes_config_path.clone());
    let uploader = MultipartUploader::new(cache.clone(), settings.upload_part_size);

    let scheduler = ReplicationScheduler::new(
        registry.clone(),
        cache.clone(),
        storages.clone(),
        uploader.clone(),
        settings.bucket_name.clone(),
        settings.finish_sweep_interval,
        settings.abort_sweep_interval,
    );
    scheduler.start().await;

    let placement = PlacementEngine::new(
        registry.clone(),
        geo_locator,
        cache.clone(),
        storages.clone(),
        Arc::new(scheduler),
        settings.bucket_name.clone(),
    );

    let rest_addr = resolve_bind_addr(&settings.rest_addr())?;
    let ctx = Arc::new(AppContext {
        settings,
        registry,
        cache,
        storages,
        placement,
        uploader,
    });

    let rest_routes = rate_limit(&ctx)
        .and(cdn_api_handlers(ctx.clone()))
        .recover(recover_fn);
    info!(rest_addr = ?rest_addr, project = %ctx.settings.project_name, "Start REST service.");
    let (_addr, server) = warp::serve(rest_routes)
        .try_bind_with_graceful_shutdown(rest_addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down.");
        })?;
    server.await;
    Ok(())
}
