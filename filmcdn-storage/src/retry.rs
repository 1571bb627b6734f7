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

//! Transient-failure handling for the S3 and redis round trips.
//!
//! An S3-compatible store answering a burst of ranged GETs and part uploads
//! will occasionally drop a connection or return a 5xx; one more attempt
//! after a short pause usually clears it. The pause ceiling doubles per
//! failed attempt and the actual pause is drawn from the upper half of the
//! ceiling, so parallel part uploads that failed together do not come back
//! in lockstep.

use std::fmt::Display;
use std::time::Duration;

use futures::Future;
use rand::Rng;
use tracing::{debug, warn};

/// Classifies failures worth another attempt. Defaults to permanent: only
/// failure modes known to clear on their own (dropped connections, 5xx,
/// throttling) should opt in.
pub trait Transient {
    fn is_transient(&self) -> bool {
        false
    }
}

/// How persistently to re-drive one remote operation.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts, the first try included.
    pub attempts: usize,
    /// Pause ceiling after the first failed attempt.
    pub first_pause: Duration,
    /// Ceilings stop doubling here.
    pub max_pause: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        // A part upload holds its whole payload in memory while waiting, so
        // the policy gives up long before a client would.
        BackoffPolicy {
            attempts: 4,
            first_pause: Duration::from_millis(if cfg!(test) { 1 } else { 500 }),
            max_pause: Duration::from_millis(if cfg!(test) { 2 } else { 10_000 }),
        }
    }
}

impl BackoffPolicy {
    /// The pause taken after `failed_attempts` failures: uniform in the
    /// upper half of a doubling, capped ceiling.
    fn pause_after(&self, failed_attempts: u32) -> Duration {
        let ceiling = self
            .first_pause
            .saturating_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)))
            .min(self.max_pause);
        let ceiling_ms = ceiling.as_millis().max(1) as u64;
        let pause_ms = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(pause_ms)
    }
}

/// Drives `make_attempt` until it succeeds, fails permanently, or the
/// policy runs out of attempts. `operation` names the call in the logs.
pub async fn with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    operation: &str,
    make_attempt: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut failed_attempts: u32 = 0;
    loop {
        let attempt_err = match make_attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        failed_attempts += 1;
        if !attempt_err.is_transient() {
            return Err(attempt_err);
        }
        if failed_attempts as usize >= policy.attempts {
            warn!(
                operation = operation,
                failed_attempts = failed_attempts,
                error = %attempt_err,
                "Giving up on a transient failure."
            );
            return Err(attempt_err);
        }
        let pause = policy.pause_after(failed_attempts);
        debug!(
            operation = operation,
            failed_attempts = failed_attempts,
            pause_ms = pause.as_millis() as u64,
            error = %attempt_err,
            "Transient failure, trying again."
        );
        tokio::time::sleep(pause).await;
    }
}
