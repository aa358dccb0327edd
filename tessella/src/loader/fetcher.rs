//! Asynchronous retrieval of tile bytes from a tile server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::info;

use crate::error::TessellaError;
use crate::tile_coord::TileCoord;

/// Source of raw bytes for a tile URL.
///
/// The loader requires nothing of the transport beyond this contract, so
/// tests substitute their own implementations.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, TessellaError>;
}

/// [`TileFetcher`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTileFetcher {
    client: reqwest::Client,
}

impl HttpTileFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tessella/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to initialize http client");
        Self { client }
    }
}

impl Default for HttpTileFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, TessellaError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TessellaError::NotFound);
        }
        if !status.is_success() {
            return Err(TessellaError::Http(format!("{url}: status {status}")));
        }

        let bytes = response.bytes().await?;
        info!("loaded tile from url {url}, byte size: {}", bytes.len());
        Ok(bytes)
    }
}

/// Substitutes `{z}`, `{x}`, `{y}` and the opaque `{key}` placeholder into
/// a tile URL template.
pub fn fill_url_template(template: &str, coord: TileCoord, api_key: Option<&str>) -> String {
    let mut url = template
        .replace("{z}", &coord.zoom.to_string())
        .replace("{x}", &coord.x.to_string())
        .replace("{y}", &coord.y.to_string());
    if let Some(key) = api_key {
        url = url.replace("{key}", key);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_coordinate_placeholders() {
        let url = fill_url_template(
            "https://tiles.test/{z}/{x}/{y}.pbf",
            TileCoord::new(14, 8654, 5115),
            None,
        );
        assert_eq!(url, "https://tiles.test/14/8654/5115.pbf");
    }

    #[test]
    fn fills_the_key_placeholder_when_a_key_is_given() {
        let template = "https://tiles.test/{z}/{x}/{y}.pbf?key={key}";
        let coord = TileCoord::new(0, 0, 0);

        let with_key = fill_url_template(template, coord, Some("secret"));
        assert_eq!(with_key, "https://tiles.test/0/0/0.pbf?key=secret");

        let without_key = fill_url_template(template, coord, None);
        assert_eq!(without_key, "https://tiles.test/0/0/0.pbf?key={key}");
    }
}
