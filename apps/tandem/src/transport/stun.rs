//! Picks the public STUN server geographically closest to the caller.

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::IceServer;

pub const GEOIP_CACHE_URL: &str =
    "https://raw.githubusercontent.com/pradt2/always-online-stun/master/geoip_cache.txt";
pub const VALID_IPV4_URL: &str =
    "https://raw.githubusercontent.com/pradt2/always-online-stun/master/valid_ipv4s.txt";
pub const USER_LOCATION_URL: &str = "https://geolocation-db.com/json/";

#[derive(Debug, Error)]
pub enum StunLookupError {
    #[error("stun directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no stun server with a known location")]
    NoCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    fn distance_to(self, other: GeoPoint) -> f64 {
        ((self.latitude - other.latitude).powi(2) + (self.longitude - other.longitude).powi(2))
            .sqrt()
    }
}

/// Choose the entry of `servers` (`host:port` lines) nearest to `origin`.
/// Servers whose host is missing from `locations` are skipped; ties keep the
/// earlier entry.
pub fn closest_server<'a>(
    servers: impl IntoIterator<Item = &'a str>,
    locations: &HashMap<String, [f64; 2]>,
    origin: GeoPoint,
) -> Option<&'a str> {
    servers
        .into_iter()
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .filter_map(|addr| {
            let host = addr.split(':').next()?;
            let [latitude, longitude] = *locations.get(host)?;
            Some((addr, origin.distance_to(GeoPoint { latitude, longitude })))
        })
        .fold(None::<(&'a str, f64)>, |best, (addr, dist)| match best {
            Some((_, best_dist)) if best_dist <= dist => best,
            _ => Some((addr, dist)),
        })
        .map(|(addr, _)| addr)
}

/// Fetch the public server list, its location cache and the caller's
/// location, and return the closest server as an ICE entry.
pub async fn fetch_closest_stun(client: &reqwest::Client) -> Result<IceServer, StunLookupError> {
    let locations: HashMap<String, [f64; 2]> = client
        .get(GEOIP_CACHE_URL)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let origin: GeoPoint = client
        .get(USER_LOCATION_URL)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let servers = client
        .get(VALID_IPV4_URL)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let addr = closest_server(servers.lines(), &locations, origin)
        .ok_or(StunLookupError::NoCandidates)?;
    tracing::debug!(server = addr, "closest stun server selected");
    Ok(IceServer::stun(format!("stun:{addr}")))
}
