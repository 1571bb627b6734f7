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

use filmcdn_cdn::CdnError;
use warp::http::header::CONTENT_TYPE;
use warp::http::StatusCode;
use warp::reply::{self, Reply};

/// Error as surfaced over HTTP. Request handlers translate core errors to
/// one of these; the body is a small JSON document.
#[derive(Debug)]
pub enum ApiError {
    Cdn(CdnError),
    /// The leaky bucket for the client overflowed.
    RateLimited,
    /// A 404 with a handler-supplied message.
    NotFound(String),
    /// An ingest failed in a way the client can only retry.
    UploadFailed,
    InvalidArgument(String),
    RouteNotFound,
}

impl warp::reject::Reject for ApiError {}

impl From<CdnError> for ApiError {
    fn from(err: CdnError) -> ApiError {
        ApiError::Cdn(err)
    }
}

impl ApiError {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ApiError::Cdn(cdn_error) => match cdn_error {
                CdnError::LocationsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                CdnError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
                CdnError::AlreadyUploaded { .. } => StatusCode::BAD_REQUEST,
                CdnError::PartSizeMismatch { .. }
                | CdnError::S3(_)
                | CdnError::Cache(_)
                | CdnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UploadFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::Cdn(cdn_error) => cdn_error.to_string(),
            ApiError::RateLimited => "Too many requests".to_string(),
            ApiError::NotFound(message) => message.clone(),
            ApiError::UploadFailed => "Upload failed. Please retry".to_string(),
            ApiError::InvalidArgument(message) => {
                format!("InvalidArgument: {}", message)
            }
            ApiError::RouteNotFound => "Route not found".to_string(),
        }
    }

    /// Builds the HTTP reply for this error.
    pub fn to_response(&self) -> warp::reply::Response {
        let body_json = serde_json::json!({ "error": self.message() }).to_string();
        let reply_with_header = reply::with_header(body_json, CONTENT_TYPE, "application/json");
        reply::with_status(reply_with_header, self.http_status_code()).into_response()
    }
}
