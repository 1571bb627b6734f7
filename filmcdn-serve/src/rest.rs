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

//! The `/api/v1/films` routes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{error, info};
use warp::http::header::LOCATION;
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::{self, Reply};
use warp::{Filter, Rejection};

use filmcdn_cdn::{BytesChunkSource, CdnError, Collection, UploadStatus};

use crate::{ApiError, AppContext};

/// Uploads are buffered before slicing into parts; one request body is
/// capped well below what a box serving this API can hold in memory.
const MAX_UPLOAD_NUM_BYTES: u64 = 1024 * 1024 * 1024;

/// All four film routes, combined.
pub fn cdn_api_handlers(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    object_url_handler(ctx.clone())
        .or(object_status_handler(ctx.clone()))
        .or(upload_object_handler(ctx.clone()))
        .or(delete_object_handler(ctx))
}

fn with_ctx(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Arc<AppContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// GET `/api/v1/films/{object_name}`: 307 redirect to a presigned URL on
/// the node serving the object.
pub fn object_url_handler(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "films" / String)
        .and(warp::get())
        .and(warp::addr::remote())
        .and(with_ctx(ctx))
        .and_then(object_url)
}

async fn object_url(
    object_name: String,
    remote_addr: Option<SocketAddr>,
    ctx: Arc<AppContext>,
) -> Result<warp::reply::Response, Infallible> {
    let client_host = remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    info!(object_name = %object_name, client_host = %client_host, "object_url");
    let reply = match ctx.placement.resolve_url(&client_host, &object_name).await {
        Ok(url) => redirect_response(&url),
        Err(err) => ApiError::from(err).to_response(),
    };
    Ok(reply)
}

fn redirect_response(url: &str) -> warp::reply::Response {
    let response_res = warp::http::Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(LOCATION, url)
        .body(warp::hyper::Body::empty());
    match response_res {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "Failed to build the redirect response.");
            ApiError::from(CdnError::Internal(err.to_string())).to_response()
        }
    }
}

/// GET `/api/v1/films/{object_name}/status`: text describing the ingest
/// status on the origin.
pub fn object_status_handler(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "films" / String / "status")
        .and(warp::get())
        .and(with_ctx(ctx))
        .and_then(object_status)
}

async fn object_status(
    object_name: String,
    ctx: Arc<AppContext>,
) -> Result<warp::reply::Response, Infallible> {
    let reply = match ctx.placement.origin_status(&object_name).await {
        Ok(Some(status_text)) => {
            reply::with_status(status_text, StatusCode::OK).into_response()
        }
        Ok(None) => {
            ApiError::NotFound(format!("Object {} not found.", object_name)).to_response()
        }
        Err(err) => ApiError::from(err).to_response(),
    };
    Ok(reply)
}

/// POST `/api/v1/films/object`: multipart/form-data ingest of one object
/// into the origin.
pub fn upload_object_handler(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "films" / "object")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_NUM_BYTES))
        .and(with_ctx(ctx))
        .and_then(upload_object)
}

async fn upload_object(
    form: FormData,
    ctx: Arc<AppContext>,
) -> Result<warp::reply::Response, Infallible> {
    let reply = match ingest_upload(form, &ctx).await {
        Ok(filename) => reply::with_status(
            format!("Upload {} completed successfully.", filename),
            StatusCode::OK,
        )
        .into_response(),
        Err(err) => err.to_response(),
    };
    Ok(reply)
}

async fn ingest_upload(mut form: FormData, ctx: &AppContext) -> Result<String, ApiError> {
    let mut file_part = None;
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|err| ApiError::InvalidArgument(err.to_string()))?
    {
        if part.name() == "file" {
            file_part = Some(part);
            break;
        }
    }
    let part = file_part
        .ok_or_else(|| ApiError::InvalidArgument("The form carries no `file` part.".to_string()))?;
    let filename = part
        .filename()
        .map(ToString::to_string)
        .ok_or_else(|| {
            ApiError::InvalidArgument("The `file` part carries no filename.".to_string())
        })?;
    let content_type = part.content_type().map(ToString::to_string);

    let mut data: Vec<u8> = Vec::new();
    let mut part_stream = part.stream();
    while let Some(buf) = part_stream
        .try_next()
        .await
        .map_err(|err| ApiError::InvalidArgument(err.to_string()))?
    {
        data.put(buf);
    }

    let nodes = ctx.registry.active_nodes().await.map_err(CdnError::from)?;
    let origin = nodes.origin().map_err(CdnError::from)?.clone();
    let origin_storage = ctx
        .storages
        .for_node(&origin)
        .map_err(CdnError::from)?;
    let total_size = data.len() as u64;
    let mut source = BytesChunkSource::new(Bytes::from(data), ctx.uploader.part_size());
    info!(filename = %filename, total_size = total_size, "upload_object");
    let upload_res = ctx
        .uploader
        .upload(
            origin_storage.as_ref(),
            &ctx.settings.bucket_name,
            &filename,
            content_type.as_deref(),
            total_size,
            &mut source,
            Collection::Api,
            UploadStatus::InProgress,
            &origin.url(),
        )
        .await;
    match upload_res {
        Ok(()) => Ok(filename),
        Err(err @ CdnError::AlreadyUploaded { .. }) => Err(ApiError::Cdn(err)),
        Err(err) => {
            error!(filename = %filename, error = %err, "Upload failed.");
            Err(ApiError::UploadFailed)
        }
    }
}

#[derive(Deserialize, Debug)]
struct DeleteObjectQuery {
    object_name: String,
}

/// DELETE `/api/v1/films/object?object_name=…`: removes the object from
/// every node.
pub fn delete_object_handler(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    warp::path!("api" / "v1" / "films" / "object")
        .and(warp::delete())
        .and(warp::query::<DeleteObjectQuery>())
        .and(with_ctx(ctx))
        .and_then(delete_object)
}

async fn delete_object(
    query: DeleteObjectQuery,
    ctx: Arc<AppContext>,
) -> Result<warp::reply::Response, Infallible> {
    info!(object_name = %query.object_name, "delete_object");
    let reply = match ctx.placement.delete_everywhere(&query.object_name).await {
        Ok(node_urls) => reply::with_status(
            format!("{} was removed from nodes {:?}", query.object_name, node_urls),
            StatusCode::OK,
        )
        .into_response(),
        Err(CdnError::ObjectNotFound { .. }) => ApiError::NotFound(format!(
            "{} doesn't exist on all nodes!",
            query.object_name
        ))
        .to_response(),
        Err(err) => ApiError::from(err).to_response(),
    };
    Ok(reply)
}

/// Returns a formatted error for the given rejection.
pub async fn recover_fn(rejection: Rejection) -> Result<impl warp::Reply, Rejection> {
    if let Some(api_error) = rejection.find::<ApiError>() {
        return Ok(api_error.to_response());
    }
    if rejection.is_not_found() {
        return Ok(ApiError::RouteNotFound.to_response());
    }
    Ok(ApiError::InvalidArgument(format!("{:?}", rejection)).to_response())
}
