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

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::error;

/// The alias under which the authoritative node is registered.
pub const ORIGIN_ALIAS: &str = "ORIGIN";

/// Errors raised while loading the node descriptor file.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum NodeConfigError {
    #[error("Node configuration file `{path}` cannot be read: {source}.")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Node configuration file `{path}` is malformed: {source}.")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No active node is registered under the `{ORIGIN_ALIAS}` alias.")]
    MissingOrigin,
}

/// One S3-compatible location, origin or edge. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// `host:port`, without scheme.
    pub endpoint: String,
    pub alias: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Node {
    /// The endpoint in URL form. Cache keys and S3 clients use this form.
    pub fn url(&self) -> String {
        format!("http://{}", self.endpoint)
    }

    pub fn is_origin(&self) -> bool {
        self.alias.eq_ignore_ascii_case("origin")
    }
}

// On-disk shape: `is_active` is spelled as the strings "True"/"False".
#[derive(Deserialize)]
struct NodeEntry {
    endpoint: String,
    alias: String,
    access_key_id: String,
    secret_access_key: String,
    city: String,
    latitude: f64,
    longitude: f64,
    is_active: String,
}

/// The set of currently active nodes, keyed by alias.
///
/// Backed by a BTreeMap so that iteration order, and therefore distance
/// tie-breaking, is deterministic.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: BTreeMap<String, Node>,
}

impl NodeSet {
    pub fn insert(&mut self, alias: impl Into<String>, node: Node) {
        self.nodes.insert(alias.into(), node);
    }

    pub fn get(&self, alias: &str) -> Option<&Node> {
        self.nodes.get(alias)
    }

    /// The origin node, or `MissingOrigin` when it is absent or inactive.
    /// Every request path goes through this check.
    pub fn origin(&self) -> Result<&Node, NodeConfigError> {
        self.nodes.get(ORIGIN_ALIAS).ok_or_else(|| {
            error!("The `{}` node is missing from the active set.", ORIGIN_ALIAS);
            NodeConfigError::MissingOrigin
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Active nodes that are not the origin.
    pub fn edges(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|node| !node.is_origin())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Loads the node descriptor file on demand.
///
/// The file is re-read on every call so that nodes can be activated or
/// retired without restarting the service.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    path: PathBuf,
}

impl NodeRegistry {
    pub fn new(path: impl Into<PathBuf>) -> NodeRegistry {
        NodeRegistry { path: path.into() }
    }

    /// Parses the descriptor document and keeps only active nodes.
    pub async fn active_nodes(&self) -> Result<NodeSet, NodeConfigError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|source| {
            NodeConfigError::Unreadable {
                path: self.path.clone(),
                source,
            }
        })?;
        parse_nodes(&content, &self.path)
    }
}

fn parse_nodes(content: &str, path: &Path) -> Result<NodeSet, NodeConfigError> {
    let entries: HashMap<String, NodeEntry> =
        serde_json::from_str(content).map_err(|source| NodeConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    let mut node_set = NodeSet::default();
    for (alias, entry) in entries {
        if entry.is_active != "True" {
            continue;
        }
        node_set.insert(
            alias,
            Node {
                endpoint: entry.endpoint,
                alias: entry.alias,
                access_key_id: entry.access_key_id,
                secret_access_key: entry.secret_access_key,
                city: entry.city,
                latitude: entry.latitude,
                longitude: entry.longitude,
            },
        );
    }
    Ok(node_set)
}
