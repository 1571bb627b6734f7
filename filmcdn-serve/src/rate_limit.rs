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

//! Leaky-bucket rate limiting, one bucket per client address per minute.

use std::net::SocketAddr;
use std::sync::Arc;

use filmcdn_cdn::unix_now;
use tracing::warn;
use warp::{Filter, Rejection};

use crate::{ApiError, AppContext};

/// The bucket dies just before its minute comes around again.
const RATE_BUCKET_TTL_SECS: u64 = 59;

/// Pre-filter applied to every route. Rejects with `ApiError::RateLimited`
/// once a client exceeds the per-minute budget. Disabled by configuration,
/// and failing open when the cache is unreachable: the limiter must never
/// take the service down.
pub fn rate_limit(
    ctx: &Arc<AppContext>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    let ctx = ctx.clone();
    warp::addr::remote()
        .and_then(move |remote_addr: Option<SocketAddr>| {
            let ctx = ctx.clone();
            async move {
                check_rate_limit(&ctx, remote_addr)
                    .await
                    .map_err(warp::reject::custom)
            }
        })
        .untuple_one()
}

async fn check_rate_limit(
    ctx: &AppContext,
    remote_addr: Option<SocketAddr>,
) -> Result<(), ApiError> {
    if !ctx.settings.is_rate_limit {
        return Ok(());
    }
    let client_addr = remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let minute_of_now = (unix_now() / 60) % 60;
    let bucket_key = format!("{}:{}", client_addr, minute_of_now);
    match ctx.cache.incr_and_expire(&bucket_key, RATE_BUCKET_TTL_SECS).await {
        Ok(request_number) => {
            if request_number > ctx.settings.request_limit_per_minute as i64 {
                return Err(ApiError::RateLimited);
            }
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "Rate limit check failed; letting the request through.");
            Ok(())
        }
    }
}
