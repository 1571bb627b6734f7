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

use filmcdn_config::NodeConfigError;
use filmcdn_storage::{CacheError, S3Error};
use thiserror::Error;

/// Errors surfaced by the placement, upload and replication engines.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CdnError {
    #[error("All S3 locations are not available")]
    LocationsUnavailable,

    #[error("'{object_name}' doesn't exist in '{bucket}' bucket")]
    ObjectNotFound { object_name: String, bucket: String },

    #[error(
        "{object_name} was already successfully uploaded to {endpoint}. If you want to upload \
         an object with the same name, you need to remove the old one first."
    )]
    AlreadyUploaded {
        object_name: String,
        endpoint: String,
    },

    /// The local stream diverged from the remote part history on resume.
    #[error(
        "Size mismatch for part {part_number}: local {local} bytes, remote {remote} bytes"
    )]
    PartSizeMismatch {
        part_number: u64,
        local: u64,
        remote: u64,
    },

    #[error("S3 error: {0}")]
    S3(#[from] S3Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Generic Result type for CDN core operations.
pub type CdnResult<T> = Result<T, CdnError>;

impl From<NodeConfigError> for CdnError {
    fn from(err: NodeConfigError) -> CdnError {
        // An unreadable node file at request time means we cannot place the
        // request anywhere, which is indistinguishable from a dead origin
        // for the caller.
        match err {
            NodeConfigError::MissingOrigin => CdnError::LocationsUnavailable,
            NodeConfigError::Unreadable { .. } | NodeConfigError::Malformed { .. } => {
                CdnError::LocationsUnavailable
            }
        }
    }
}
