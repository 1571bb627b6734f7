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

//! `filmcdn-cdn` is the CDN core: given an object request, decide which
//! node serves it; ingest client uploads to the origin; replicate objects
//! from the origin to the edges in the background.
//!
//! The crate is wired from capability traits only — object storage, cache,
//! geolocation, replication queue — so every engine runs against mocks in
//! tests and against rusoto/redis in production.

mod error;
mod geo;
mod model;
mod multipart;
mod placement;
mod scheduler;

pub use self::error::{CdnError, CdnResult};
#[cfg(any(test, feature = "testsuite"))]
pub use self::geo::MockGeoLocator;
pub use self::geo::{
    closest_to, find_closest_node, great_circle_distance_km, GeoLocator, GeoPoint,
    IpapiGeoLocator,
};
pub use self::model::{
    object_name_from_key, record_key, unix_now, Collection, UploadRecord, UploadStatus,
};
pub use self::multipart::{
    BytesChunkSource, ChunkSource, MultipartUploader, RangedGetChunkSource,
};
pub use self::placement::{Placement, PlacementEngine};
#[cfg(any(test, feature = "testsuite"))]
pub use self::scheduler::MockReplicationQueue;
pub use self::scheduler::{CopyJob, ReplicationQueue, ReplicationScheduler, STALE_AFTER};
