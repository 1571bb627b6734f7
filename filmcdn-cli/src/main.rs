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

use filmcdn_config::Settings;
use filmcdn_serve::serve_cli;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn setup_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    setup_logging();
    // The whole configuration is environment-driven; a readable message and
    // a non-zero exit are all a broken deployment needs.
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            error!("Configuration error: {:#}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = serve_cli(settings).await {
        error!("Service failed: {:#}", err);
        std::process::exit(1);
    }
}
