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

//! `filmcdn-storage` holds the two capability sets the CDN core builds upon:
//!
//! - [`ObjectStorage`]: an S3-compatible object store (origin or edge),
//!   backed by rusoto.
//! - [`Cache`]: a key/value store with hash records, pattern scanning and
//!   pipelined counters, backed by redis.
//!
//! Concrete implementations are selected at wiring time; the engines only
//! ever see the traits.

mod cache;
mod error;
mod object_storage;
mod retry;

#[cfg(any(test, feature = "testsuite"))]
pub use self::cache::MockCache;
pub use self::cache::{Cache, RamCache, RedisCache};
#[cfg(any(test, feature = "testsuite"))]
pub use self::object_storage::{MockObjectStorage, MockObjectStorageFactory};
pub use self::object_storage::{
    ObjectPart, ObjectStorage, ObjectStorageFactory, RangeInfo, S3CompatibleObjectStorage,
    S3ObjectStorageFactory,
};
pub use self::retry::{with_backoff, BackoffPolicy, Transient};
pub use crate::error::{CacheError, CacheResult, S3Error, S3Result};
