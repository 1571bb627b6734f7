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

//! Environment-driven configuration and the node descriptor registry.

mod node;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

pub use crate::node::{Node, NodeConfigError, NodeRegistry, NodeSet, ORIGIN_ALIAS};

/// S3 rejects multipart parts smaller than 5 MiB (except the last one).
pub const PART_SIZE_MINIMUM: u64 = 5 * 1024 * 1024;

const DEFAULT_NODES_CONFIG_PATH: &str = "./.env.minio.json";
const DEFAULT_REQUEST_LIMIT_PER_MINUTE: u32 = 20;
const DEFAULT_FINISH_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_ABORT_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Runtime settings, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_name: String,
    pub host: String,
    pub port: u16,
    pub bucket_name: String,
    pub upload_part_size: u64,
    pub ipapi_key: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub cache_expire_in_seconds: u64,
    pub request_limit_per_minute: u32,
    pub is_rate_limit: bool,
    pub nodes_config_path: PathBuf,
    pub finish_sweep_interval: Duration,
    pub abort_sweep_interval: Duration,
}

impl Settings {
    /// Reads and validates every setting. Any missing or unparsable variable
    /// fails startup: there is no sensible degraded mode without a bucket or
    /// a part size.
    pub fn from_env() -> anyhow::Result<Settings> {
        let settings = Settings {
            project_name: required_var("PROJECT_NAME")?,
            host: required_var("HOST_CDN")?,
            port: parsed_var("PORT_CDN")?,
            bucket_name: required_var("BUCKET_NAME")?,
            upload_part_size: parsed_var("UPLOAD_PART_SIZE")?,
            ipapi_key: required_var("IPAPI_KEY")?,
            redis_host: required_var("REDIS_HOST")?,
            redis_port: parsed_var("REDIS_PORT")?,
            cache_expire_in_seconds: parsed_var("CACHE_EXPIRE_IN_SECONDS")?,
            request_limit_per_minute: parsed_var_or(
                "REQUEST_LIMIT_PER_MINUTE",
                DEFAULT_REQUEST_LIMIT_PER_MINUTE,
            )?,
            is_rate_limit: bool_var_or("IS_RATE_LIMIT", false)?,
            nodes_config_path: PathBuf::from(
                std::env::var("NODES_CONFIG_PATH")
                    .unwrap_or_else(|_| DEFAULT_NODES_CONFIG_PATH.to_string()),
            ),
            finish_sweep_interval: Duration::from_secs(parsed_var_or(
                "FINISH_SWEEP_INTERVAL_SECONDS",
                DEFAULT_FINISH_SWEEP_INTERVAL_SECS,
            )?),
            abort_sweep_interval: Duration::from_secs(parsed_var_or(
                "ABORT_SWEEP_INTERVAL_SECONDS",
                DEFAULT_ABORT_SWEEP_INTERVAL_SECS,
            )?),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.upload_part_size <= PART_SIZE_MINIMUM {
            bail!(
                "`UPLOAD_PART_SIZE` must be greater than {} bytes, got {}.",
                PART_SIZE_MINIMUM,
                self.upload_part_size
            );
        }
        Ok(())
    }

    /// The address the REST service binds to.
    pub fn rest_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn required_var(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("Environment variable `{}` is not set.", key))
}

fn parsed_var<T>(key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    required_var(key)?
        .parse::<T>()
        .with_context(|| format!("Failed to parse environment variable `{}`.", key))
}

fn parsed_var_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("Failed to parse environment variable `{}`.", key)),
        Err(_) => Ok(default),
    }
}

/// The node descriptor file spells booleans as `"True"` / `"False"`, and the
/// environment follows the same convention.
fn bool_var_or(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(value) => match value.as_str() {
            "True" | "true" => Ok(true),
            "False" | "false" => Ok(false),
            _ => bail!("Expected `True` or `False` for `{}`, got `{}`.", key, value),
        },
        Err(_) => Ok(default),
    }
}
