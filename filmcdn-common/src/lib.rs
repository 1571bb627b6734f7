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

//! Small utilities shared across the filmcdn crates.

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::Context;

/// Turns the configured `host:port` pair into the address the REST server
/// binds to. A hostname resolving to several addresses binds the first one.
pub fn resolve_bind_addr(host_and_port: &str) -> anyhow::Result<SocketAddr> {
    host_and_port
        .to_socket_addrs()
        .with_context(|| format!("`{}` is not a valid `host:port` pair.", host_and_port))?
        .next()
        .with_context(|| format!("`{}` does not resolve to any address.", host_and_port))
}

pub fn setup_logging_for_tests() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .without_time()
            .init();
    });
}
