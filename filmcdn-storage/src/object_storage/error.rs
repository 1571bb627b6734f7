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

use std::error::Error as StdError;
use std::fmt;
use std::io;

use rusoto_core::RusotoError;

use crate::retry::Transient;
use crate::S3Error;

/// Newtype around `RusotoError` so that retryability and the conversion
/// into [`S3Error`] can be expressed once for every S3 operation.
#[derive(Debug)]
pub struct RusotoErrorWrapper<E: StdError + 'static>(pub RusotoError<E>);

impl<E: StdError> From<RusotoError<E>> for RusotoErrorWrapper<E> {
    fn from(err: RusotoError<E>) -> Self {
        RusotoErrorWrapper(err)
    }
}

impl<E: StdError> From<io::Error> for RusotoErrorWrapper<E> {
    fn from(err: io::Error) -> Self {
        RusotoErrorWrapper(RusotoError::ParseError(err.to_string()))
    }
}

impl<E: StdError> fmt::Display for RusotoErrorWrapper<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<E: StdError> StdError for RusotoErrorWrapper<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.0)
    }
}

impl<E: StdError> Transient for RusotoErrorWrapper<E> {
    fn is_transient(&self) -> bool {
        match &self.0 {
            RusotoError::HttpDispatch(_) => true,
            RusotoError::Unknown(http_resp) => http_resp.status.is_server_error(),
            _ => false,
        }
    }
}

impl<E: StdError + Send + Sync + 'static> From<RusotoErrorWrapper<E>> for S3Error {
    fn from(err: RusotoErrorWrapper<E>) -> S3Error {
        let build: fn(anyhow::Error) -> S3Error = match &err.0 {
            RusotoError::Unknown(http_resp) => match http_resp.status.as_u16() {
                401 | 403 => |source| S3Error::Denied { source },
                // 416 shows up when probing a 1-byte range of a missing key
                // on some S3-compatible servers.
                404 | 416 => |source| S3Error::NotFound { source },
                _ => |source| S3Error::Failed { source },
            },
            RusotoError::Credentials(_) => |source| S3Error::Denied { source },
            _ => |source| S3Error::Failed { source },
        };
        build(err.into())
    }
}
