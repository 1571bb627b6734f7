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

//! Client→node proximity: IP geolocation and great-circle distance.

use async_trait::async_trait;
use filmcdn_config::{Node, NodeSet};
use serde::Deserialize;
use tracing::{error, info, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the globe, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Great-circle distance between two points, via the haversine formula.
pub fn great_circle_distance_km(from: GeoPoint, to: GeoPoint) -> f64 {
    let from_lat = from.latitude.to_radians();
    let to_lat = to.latitude.to_radians();
    let delta_lat = (to.latitude - from.latitude).to_radians();
    let delta_lon = (to.longitude - from.longitude).to_radians();
    let a = (delta_lat / 2.0).sin().powi(2)
        + from_lat.cos() * to_lat.cos() * (delta_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Resolves a client IP to coordinates.
///
/// A miss is not an error: placement degrades to the origin, so
/// implementations swallow lookup failures and return `None`.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait GeoLocator: Send + Sync + 'static {
    async fn locate(&self, client_ip: &str) -> Option<GeoPoint>;
}

#[derive(Deserialize)]
struct IpapiResponse {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Geolocation through the remote <https://ipapi.co> lookup service.
pub struct IpapiGeoLocator {
    http_client: reqwest::Client,
    api_key: String,
}

impl IpapiGeoLocator {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<IpapiGeoLocator> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(IpapiGeoLocator {
            http_client,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl GeoLocator for IpapiGeoLocator {
    async fn locate(&self, client_ip: &str) -> Option<GeoPoint> {
        let url = format!(
            "https://ipapi.co/{}/json/?key={}",
            client_ip, self.api_key
        );
        let response = match self.http_client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(client_ip = %client_ip, error = %err, "Geolocation lookup failed.");
                return None;
            }
        };
        let payload: IpapiResponse = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                error!(client_ip = %client_ip, error = %err, "Geolocation response was unreadable.");
                return None;
            }
        };
        match (payload.latitude, payload.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => {
                warn!(client_ip = %client_ip, "IP not found in the geolocation database.");
                None
            }
        }
    }
}

/// The active node closest to `client`. First node wins distance ties; the
/// node set iterates in a deterministic order.
pub fn closest_to<'a>(client: GeoPoint, nodes: &'a NodeSet) -> Option<&'a Node> {
    let mut closest: Option<(&Node, f64)> = None;
    for node in nodes.iter() {
        let node_point = GeoPoint {
            latitude: node.latitude,
            longitude: node.longitude,
        };
        let distance_km = great_circle_distance_km(client, node_point);
        match closest {
            Some((_, min_distance_km)) if distance_km >= min_distance_km => {}
            _ => closest = Some((node, distance_km)),
        }
    }
    closest.map(|(node, _)| node)
}

/// Resolves the client and picks the closest active node. `None` when the
/// geolocation lookup misses; the caller falls back to the origin.
pub async fn find_closest_node(
    locator: &dyn GeoLocator,
    client_ip: &str,
    nodes: &NodeSet,
) -> Option<Node> {
    let client_point = locator.locate(client_ip).await?;
    let node = closest_to(client_point, nodes)?.clone();
    info!(endpoint = %node.endpoint, city = %node.city, "Use location");
    Some(node)
}
