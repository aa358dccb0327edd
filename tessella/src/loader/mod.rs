//! Asynchronous tile loading over a memory → disk → network cache
//! hierarchy.
//!
//! The renderer asks for tiles with [`TileLoader::request_tiles`] from its
//! paint path; the call returns immediately with whatever is already
//! decoded and schedules background jobs for the rest. Each tile moves
//! through a small state machine tracked in the memory map:
//!
//! ```text
//! (absent) --request--> Pending --disk-hit--> Ok
//!                             \--disk-miss--> (net) --> Ok | UnknownError
//!                             \--parse-fail--> ParsingFailed
//!                             \--close------> Cancelled
//! ```
//!
//! States only ever move from `Pending` to one terminal state; a tile is
//! re-fetched only after explicit eviction, which the loader does not do
//! on its own.

mod disk_cache;
mod fetcher;

pub use disk_cache::TileDiskCache;
pub use fetcher::{fill_url_template, HttpTileFetcher, TileFetcher};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, trace, warn};
use parking_lot::Mutex;
use tessella_mvt::VectorTile;
use tokio::runtime::Runtime;

use crate::error::TessellaError;
use crate::style::StyleSheet;
use crate::tile_coord::TileCoord;

/// Callback invoked from a worker thread once for every tile that reaches
/// [`LoadedTileState::Ok`]. It carries no payload; the renderer re-reads
/// the loader on its next frame.
pub type TileLoadedCallback = Arc<dyn Fn(TileCoord) + Send + Sync>;

/// Lifecycle state of a tile tracked by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedTileState {
    /// A load job is scheduled or running.
    Pending,
    /// The tile decoded successfully and can be read.
    Ok,
    /// The bytes could not be decoded as a vector tile.
    ParsingFailed,
    /// The loader was closed while the tile was still pending.
    Cancelled,
    /// Neither disk nor network produced usable bytes.
    UnknownError,
}

struct StoredTile {
    state: LoadedTileState,
    tile: Option<Arc<VectorTile>>,
}

impl StoredTile {
    fn pending() -> Self {
        Self {
            state: LoadedTileState::Pending,
            tile: None,
        }
    }

    fn ready(&self) -> Option<&Arc<VectorTile>> {
        match self.state {
            LoadedTileState::Ok => self.tile.as_ref(),
            _ => None,
        }
    }
}

type TileMemory = Arc<Mutex<BTreeMap<TileCoord, StoredTile>>>;

/// Scoped read handle over the tiles that were ready at the time of a
/// [`TileLoader::request_tiles`] call.
///
/// The handle shares ownership of the tiles it references, so they remain
/// valid for as long as the handle lives. Dropping it has no other effect;
/// the loader's cache outlives the handle.
pub struct RequestTilesResult {
    tiles: BTreeMap<TileCoord, Arc<VectorTile>>,
    style: Option<Arc<StyleSheet>>,
}

impl RequestTilesResult {
    pub fn get(&self, coord: TileCoord) -> Option<&VectorTile> {
        self.tiles.get(&coord).map(Arc::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileCoord, &VectorTile)> {
        self.tiles.iter().map(|(coord, tile)| (*coord, tile.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Stylesheet to paint these tiles with; `None` for dummy loaders.
    pub fn style_sheet(&self) -> Option<&StyleSheet> {
        self.style.as_deref()
    }
}

/// Serves vector tiles from memory, falling back to the disk cache and the
/// tile server for misses.
pub struct TileLoader {
    memory: TileMemory,
    cache: TileDiskCache,
    fetcher: Option<Arc<dyn TileFetcher>>,
    url_template: Option<String>,
    api_key: Option<String>,
    style: Option<Arc<StyleSheet>>,
    workers: Runtime,
}

impl TileLoader {
    /// Web-enabled loader downloading tiles through `url_template`.
    ///
    /// The template must contain `{z}`, `{x}` and `{y}` placeholders; a
    /// `{key}` placeholder is substituted with `api_key`.
    pub fn from_url_template(
        url_template: impl Into<String>,
        api_key: Option<String>,
        style: StyleSheet,
    ) -> Result<Self, TessellaError> {
        Self::build(
            TileDiskCache::in_default_location(),
            Some(Arc::new(HttpTileFetcher::new()) as Arc<dyn TileFetcher>),
            Some(url_template.into()),
            api_key,
            Some(style),
        )
    }

    /// Loader that only reads the disk cache; misses become
    /// [`LoadedTileState::UnknownError`].
    pub fn new_local_only(style: StyleSheet) -> Result<Self, TessellaError> {
        Self::build(TileDiskCache::in_default_location(), None, None, None, Some(style))
    }

    /// Loader without a stylesheet reading from a fixed cache directory.
    /// Used by tests; requesting a stylesheet from it yields nothing.
    pub fn new_dummy(cache_root: impl Into<PathBuf>) -> Result<Self, TessellaError> {
        Self::build(TileDiskCache::new(cache_root), None, None, None, None)
    }

    /// Replaces the transport and URL template, keeping everything else.
    /// This is how tests exercise the network tier without a server.
    pub fn with_fetcher(
        mut self,
        fetcher: Arc<dyn TileFetcher>,
        url_template: impl Into<String>,
    ) -> Self {
        self.fetcher = Some(fetcher);
        self.url_template = Some(url_template.into());
        self
    }

    fn build(
        cache: TileDiskCache,
        fetcher: Option<Arc<dyn TileFetcher>>,
        url_template: Option<String>,
        api_key: Option<String>,
        style: Option<StyleSheet>,
    ) -> Result<Self, TessellaError> {
        let workers = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tessella-tile-worker")
            .build()?;

        Ok(Self {
            memory: TileMemory::default(),
            cache,
            fetcher,
            url_template,
            api_key,
            style: style.map(Arc::new),
            workers,
        })
    }

    /// Returns the requested tiles that are ready right now and, when
    /// `load_missing` is set, schedules background jobs for the rest.
    ///
    /// The call never blocks beyond one short-held lock of the memory map,
    /// so it is safe from a paint callback. It is not re-entrant on the
    /// same loader, but concurrent calls from different threads are fine.
    ///
    /// `on_loaded` fires once per tile that later reaches the `Ok` state,
    /// on a worker thread; failures are silent and must be observed with
    /// [`Self::tile_state`] or a later request. Without a callback there
    /// is no way to learn of finished loads, so `load_missing` is treated
    /// as false in that case. Coordinates that already have a memory entry
    /// in any state are never re-scheduled.
    pub fn request_tiles(
        &self,
        requested: &BTreeSet<TileCoord>,
        on_loaded: Option<TileLoadedCallback>,
        load_missing: bool,
    ) -> RequestTilesResult {
        let load_missing = load_missing && on_loaded.is_some();

        let mut ready = BTreeMap::new();
        let mut jobs = Vec::new();
        {
            let mut memory = self.memory.lock();
            for &coord in requested {
                match memory.get(&coord) {
                    Some(stored) => {
                        if let Some(tile) = stored.ready() {
                            ready.insert(coord, Arc::clone(tile));
                        }
                    }
                    None if load_missing => {
                        memory.insert(coord, StoredTile::pending());
                        jobs.push(coord);
                    }
                    None => {}
                }
            }
        }

        for coord in jobs {
            self.spawn_load(coord, on_loaded.clone());
        }

        RequestTilesResult {
            tiles: ready,
            style: self.style.clone(),
        }
    }

    /// Grabs already-loaded tiles without scheduling anything.
    pub fn peek_tiles(&self, requested: &BTreeSet<TileCoord>) -> RequestTilesResult {
        self.request_tiles(requested, None, false)
    }

    /// Current state of a tile, if it was ever requested. Thread safe.
    pub fn tile_state(&self, coord: TileCoord) -> Option<LoadedTileState> {
        self.memory.lock().get(&coord).map(|stored| stored.state)
    }

    /// Full cache-file path for a tile, whether the file exists or not.
    pub fn tile_disk_path(&self, coord: TileCoord) -> PathBuf {
        self.cache.tile_path(coord)
    }

    pub fn style_sheet(&self) -> Option<&StyleSheet> {
        self.style.as_deref()
    }

    /// Cancels every tile that is still pending. Jobs already in flight
    /// observe the cancellation when they try to publish their result and
    /// drop it; no callback fires for a cancelled tile.
    pub fn close(&self) {
        let mut memory = self.memory.lock();
        for stored in memory.values_mut() {
            if stored.state == LoadedTileState::Pending {
                stored.state = LoadedTileState::Cancelled;
            }
        }
    }

    fn spawn_load(&self, coord: TileCoord, on_loaded: Option<TileLoadedCallback>) {
        let memory = Arc::clone(&self.memory);
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        let url = self
            .url_template
            .as_deref()
            .map(|template| fill_url_template(template, coord, self.api_key.as_deref()));

        self.workers.spawn(async move {
            let (state, tile) =
                match resolve_tile(coord, &cache, fetcher.as_deref(), url.as_deref()).await {
                    Ok(tile) => (LoadedTileState::Ok, Some(Arc::new(tile))),
                    Err(state) => (state, None),
                };

            let notify = {
                let mut memory = memory.lock();
                match memory.get_mut(&coord) {
                    Some(stored) if stored.state == LoadedTileState::Pending => {
                        stored.state = state;
                        stored.tile = tile;
                        state == LoadedTileState::Ok
                    }
                    _ => {
                        // The entry was cancelled or already resolved; the
                        // first terminal state wins.
                        warn!("tile {coord} finished loading but was no longer pending");
                        false
                    }
                }
            };

            if notify {
                if let Some(on_loaded) = on_loaded {
                    on_loaded(coord);
                }
            }
        });
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Walks the disk and network tiers and decodes the result. The error side
/// carries the terminal state the tile should take.
async fn resolve_tile(
    coord: TileCoord,
    cache: &TileDiskCache,
    fetcher: Option<&dyn TileFetcher>,
    url: Option<&str>,
) -> Result<VectorTile, LoadedTileState> {
    let bytes = match cache.read(coord) {
        Some(bytes) => {
            trace!("disk cache hit for tile {coord}");
            bytes
        }
        None => {
            let (Some(fetcher), Some(url)) = (fetcher, url) else {
                return Err(LoadedTileState::UnknownError);
            };
            let bytes = match fetcher.fetch(url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("failed to fetch tile {coord} from {url}: {err}");
                    return Err(LoadedTileState::UnknownError);
                }
            };
            // Disk-cache writes are best effort; a full disk must not take
            // the tile down with it.
            if let Err(err) = cache.write(coord, &bytes) {
                warn!("failed to write tile {coord} to the disk cache: {err}");
            }
            bytes
        }
    };

    VectorTile::decode(bytes).map_err(|err| {
        error!("failed to parse tile {coord}: {err}");
        LoadedTileState::ParsingFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use bytes::Bytes;

    // Minimal valid vector tile: one layer "land" with a single point
    // feature carrying {class: "grass"}. Encoded by hand against the MVT
    // protobuf schema so the tests need no binary fixture files.
    fn tiny_tile_bytes() -> Vec<u8> {
        let value: &[u8] = b"\x0a\x05grass"; // Value { string_value: "grass" }
        let feature: &[u8] = &[
            0x12, 0x02, 0x00, 0x00, // tags: [0, 0]
            0x18, 0x01, // type: Point
            0x22, 0x03, 0x09, 0x02, 0x02, // geometry: MoveTo(+1, +1)
        ];

        let mut layer = vec![0x78, 0x02]; // version: 2
        layer.extend(b"\x0a\x04land"); // name: "land"
        layer.extend([0x12, feature.len() as u8]);
        layer.extend(feature);
        layer.extend(b"\x1a\x05class"); // keys[0]
        layer.extend([0x22, value.len() as u8]);
        layer.extend(value);
        layer.extend([0x28, 0x80, 0x20]); // extent: 4096

        let mut tile = vec![0x1a, layer.len() as u8];
        tile.extend(layer);
        tile
    }

    fn wait_for_terminal_state(loader: &TileLoader, coord: TileCoord) -> LoadedTileState {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(state) = loader.tile_state(coord) {
                if state != LoadedTileState::Pending {
                    return state;
                }
            }
            assert!(
                Instant::now() < deadline,
                "tile {coord} never reached a terminal state"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl TileFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, TessellaError> {
            Ok(Bytes::from(self.0.clone()))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl TileFetcher for FailingFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, TessellaError> {
            Err(TessellaError::Http(format!("{url}: status 503")))
        }
    }

    struct StalledFetcher;

    #[async_trait]
    impl TileFetcher for StalledFetcher {
        async fn fetch(&self, _url: &str) -> Result<Bytes, TessellaError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(TessellaError::NotFound)
        }
    }

    #[test]
    fn new_loader_has_no_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let loader = TileLoader::new_dummy(dir.path()).unwrap();

        let result = loader.request_tiles(&BTreeSet::new(), None, true);
        assert!(result.is_empty());
        assert!(result.style_sheet().is_none());
        assert_eq!(loader.tile_state(TileCoord::new(0, 0, 0)), None);
    }

    #[test]
    fn loads_cached_tile_and_signals_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(0, 0, 0);
        TileDiskCache::new(dir.path())
            .write(coord, &tiny_tile_bytes())
            .unwrap();

        let loader = TileLoader::new_dummy(dir.path()).unwrap();
        let (sender, receiver) = mpsc::channel();
        let callback: TileLoadedCallback = Arc::new(move |coord| {
            sender.send(coord).unwrap();
        });

        let first = loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);
        assert!(first.get(coord).is_none());

        let loaded = receiver
            .recv_timeout(Duration::from_secs(3))
            .expect("tile load timed out");
        assert_eq!(loaded, coord);
        assert_eq!(loader.tile_state(coord), Some(LoadedTileState::Ok));

        let second = loader.peek_tiles(&BTreeSet::from([coord]));
        let tile = second.get(coord).expect("loaded tile missing from result");
        assert_eq!(tile.layers.len(), 1);
        assert_eq!(tile.layers[0].name, "land");

        // Exactly one callback per successful load.
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn marks_undecodable_bytes_as_parsing_failed() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(1, 0, 0);
        TileDiskCache::new(dir.path())
            .write(coord, &[0xff, 0xff, 0xff])
            .unwrap();

        let loader = TileLoader::new_dummy(dir.path()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: TileLoadedCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);

        assert_eq!(
            wait_for_terminal_state(&loader, coord),
            LoadedTileState::ParsingFailed
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let result = loader.peek_tiles(&BTreeSet::from([coord]));
        assert!(result.get(coord).is_none());
    }

    #[test]
    fn disk_miss_without_network_is_an_unknown_error() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(2, 3, 1);
        let loader = TileLoader::new_dummy(dir.path()).unwrap();

        let callback: TileLoadedCallback = Arc::new(|_| {});
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);

        assert_eq!(
            wait_for_terminal_state(&loader, coord),
            LoadedTileState::UnknownError
        );
    }

    #[test]
    fn request_without_callback_does_not_schedule_loading() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(0, 0, 0);
        TileDiskCache::new(dir.path())
            .write(coord, &tiny_tile_bytes())
            .unwrap();

        let loader = TileLoader::new_dummy(dir.path()).unwrap();
        let result = loader.request_tiles(&BTreeSet::from([coord]), None, true);

        assert!(result.is_empty());
        assert_eq!(loader.tile_state(coord), None);
    }

    #[test]
    fn downloads_missing_tiles_and_fills_the_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(5, 17, 11);
        let loader = TileLoader::new_dummy(dir.path()).unwrap().with_fetcher(
            Arc::new(StaticFetcher(tiny_tile_bytes())),
            "https://tiles.test/{z}/{x}/{y}.pbf",
        );

        let (sender, receiver) = mpsc::channel();
        let callback: TileLoadedCallback = Arc::new(move |coord| {
            sender.send(coord).unwrap();
        });
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);

        receiver
            .recv_timeout(Duration::from_secs(3))
            .expect("tile download timed out");
        assert_eq!(loader.tile_state(coord), Some(LoadedTileState::Ok));

        // Round-trip through the disk tier: the fetched bytes must now be
        // cached verbatim.
        let cached = std::fs::read(loader.tile_disk_path(coord)).unwrap();
        assert_eq!(cached, tiny_tile_bytes());
    }

    #[test]
    fn failed_downloads_become_unknown_errors() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(4, 2, 9);
        let loader = TileLoader::new_dummy(dir.path())
            .unwrap()
            .with_fetcher(Arc::new(FailingFetcher), "https://tiles.test/{z}/{x}/{y}.pbf");

        let callback: TileLoadedCallback = Arc::new(|_| {});
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);

        assert_eq!(
            wait_for_terminal_state(&loader, coord),
            LoadedTileState::UnknownError
        );
        assert!(!loader.tile_disk_path(coord).exists());
    }

    #[test]
    fn concurrent_requests_schedule_one_job_and_one_signal() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(2, 1, 1);
        TileDiskCache::new(dir.path())
            .write(coord, &tiny_tile_bytes())
            .unwrap();

        let loader = TileLoader::new_dummy(dir.path()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let loader = &loader;
                let calls = Arc::clone(&calls);
                scope.spawn(move || {
                    let callback: TileLoadedCallback = Arc::new(move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    });
                    loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);
                });
            }
        });

        assert_eq!(
            wait_for_terminal_state(&loader, coord),
            LoadedTileState::Ok
        );
        // Give a hypothetical duplicate job time to fire before counting.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_cancels_pending_tiles_without_signaling() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(2, 1, 1);
        let loader = TileLoader::new_dummy(dir.path())
            .unwrap()
            .with_fetcher(Arc::new(StalledFetcher), "https://tiles.test/{z}/{x}/{y}.pbf");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: TileLoadedCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);

        loader.close();
        assert_eq!(loader.tile_state(coord), Some(LoadedTileState::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_states_are_never_rescheduled() {
        let dir = tempfile::tempdir().unwrap();
        let coord = TileCoord::new(1, 1, 0);
        let loader = TileLoader::new_dummy(dir.path()).unwrap();

        let callback: TileLoadedCallback = Arc::new(|_| {});
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback.clone()), true);
        assert_eq!(
            wait_for_terminal_state(&loader, coord),
            LoadedTileState::UnknownError
        );

        // Even though the tile failed, a new request must not re-enter the
        // pipeline; recovery requires explicit eviction.
        loader.request_tiles(&BTreeSet::from([coord]), Some(callback), true);
        assert_eq!(
            loader.tile_state(coord),
            Some(LoadedTileState::UnknownError)
        );
    }
}
