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

//! Failures of the two remote dependencies, shaped the way the engines
//! consume them.

use thiserror::Error;

/// Failure of one S3 round trip.
///
/// A missing object or bucket is routine — placement probes for objects and
/// branches on it — so it is its own variant rather than a status buried in
/// a generic wrapper. Everything else only differs in how it is reported.
#[derive(Error, Debug)]
pub enum S3Error {
    /// The object, bucket or multipart upload is not on this node.
    #[error("Not found on the store: {source}")]
    NotFound {
        #[source]
        source: anyhow::Error,
    },
    /// The node rejected our credentials or the operation.
    #[error("The store denied the request: {source}")]
    Denied {
        #[source]
        source: anyhow::Error,
    },
    /// The store failed, answered garbage, or could not be reached.
    #[error("The store failed: {source}")]
    Failed {
        #[source]
        source: anyhow::Error,
    },
}

/// Generic Result type for S3 operations.
pub type S3Result<T> = Result<T, S3Error>;

impl S3Error {
    /// True for the routine "nothing there" outcome the probing paths
    /// treat as data rather than as a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, S3Error::NotFound { .. })
    }

    pub(crate) fn failed(source: impl Into<anyhow::Error>) -> S3Error {
        S3Error::Failed {
            source: source.into(),
        }
    }
}

impl From<std::io::Error> for S3Error {
    fn from(err: std::io::Error) -> S3Error {
        // Read failures while draining a response body are store-side
        // trouble, never a missing object.
        S3Error::failed(err)
    }
}

/// Error raised by the key/value cache backing upload state and rate
/// counters.
#[derive(Error, Debug)]
#[error("CacheError({source})")]
pub struct CacheError {
    #[from]
    source: anyhow::Error,
}

/// Generic Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> CacheError {
        CacheError {
            source: anyhow::Error::from(err),
        }
    }
}
