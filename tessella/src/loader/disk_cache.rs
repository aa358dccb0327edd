//! On-disk tile cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::debug;

use crate::error::TessellaError;
use crate::tile_coord::TileCoord;

const CACHE_SUBPATH: &str = "tile-cache";

/// Sequence number keeping concurrent temp-file names unique within the
/// process.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stores raw tile bytes under `<root>/<zoom>/<x>/<y>.mvt`.
///
/// Writes go through a temp file and a rename, so a reader racing a writer
/// sees either the old bytes, the new bytes or a missing file, never a
/// torn one. When two writers race on the same coordinate the last rename
/// wins. There is no eviction.
#[derive(Debug, Clone)]
pub struct TileDiskCache {
    root: PathBuf,
}

impl TileDiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache rooted in the platform cache location.
    pub fn in_default_location() -> Self {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(CACHE_SUBPATH))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the cache file for `coord`, whether it exists or not.
    pub fn tile_path(&self, coord: TileCoord) -> PathBuf {
        self.root
            .join(coord.zoom.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.mvt", coord.y))
    }

    /// Reads the cached bytes for `coord`. Any read failure is a miss.
    pub fn read(&self, coord: TileCoord) -> Option<Bytes> {
        std::fs::read(self.tile_path(coord)).ok().map(Bytes::from)
    }

    /// Writes tile bytes, creating parent directories lazily.
    pub fn write(&self, coord: TileCoord, bytes: &[u8]) -> Result<(), TessellaError> {
        let path = self.tile_path(coord);
        let parent = path.parent().ok_or(TessellaError::NotFound)?;
        std::fs::create_dir_all(parent)?;

        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_extension(format!("tmp.{:x}.{seq:x}", std::process::id()));
        std::fs::write(&temp, bytes)?;
        std::fs::rename(&temp, &path)?;

        debug!("tile {coord} saved to cache file {path:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_path_follows_the_zoom_x_y_scheme() {
        let cache = TileDiskCache::new("/tmp/tiles");
        assert_eq!(
            cache.tile_path(TileCoord::new(14, 8654, 5115)),
            Path::new("/tmp/tiles/14/8654/5115.mvt")
        );
    }

    #[test]
    fn written_bytes_read_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::new(dir.path());
        let coord = TileCoord::new(3, 4, 5);
        let payload = vec![0u8, 1, 2, 250, 251, 252];

        cache.write(coord, &payload).unwrap();
        assert_eq!(cache.read(coord).unwrap(), payload.as_slice());
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::new(dir.path());
        let coord = TileCoord::new(0, 0, 0);

        cache.write(coord, b"old").unwrap();
        cache.write(coord, b"new").unwrap();
        assert_eq!(cache.read(coord).unwrap(), b"new".as_slice());
    }

    #[test]
    fn missing_tile_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::new(dir.path());
        assert!(cache.read(TileCoord::new(1, 0, 1)).is_none());
    }

    #[test]
    fn no_temp_files_remain_after_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::new(dir.path());
        let coord = TileCoord::new(2, 1, 3);
        cache.write(coord, b"payload").unwrap();

        let files: Vec<_> = std::fs::read_dir(cache.tile_path(coord).parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(files, ["3.mvt"]);
    }
}
