//! Viewport math: mapping a zoomable viewport over the normalized world
//! square to the set of tiles needed to paint it.

use crate::tile_coord::{grid_side, TileCoord, MAX_ZOOM};

/// Latitude cutoff of the Web Mercator projection, in radians.
const MERCATOR_PHI_CUTOFF: f64 = 1.484_422_229_7;

/// A viewport over the world-normalized coordinate space.
///
/// The center lies in `[0, 1]²` with y growing southwards. `zoom` is the
/// continuous viewport zoom: at zoom 0 the viewport covers the whole world
/// square and every whole step halves the covered extent. `aspect` is
/// width divided by height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub center_x: f64,
    pub center_y: f64,
    pub zoom: f64,
    pub aspect: f64,
}

impl Viewport {
    pub fn new(center_x: f64, center_y: f64, zoom: f64, aspect: f64) -> Self {
        Self {
            center_x,
            center_y,
            zoom,
            aspect,
        }
    }

    /// Integer map zoom for this viewport. `offset` is zero in normal use
    /// and overridable for debugging.
    pub fn map_zoom(&self, offset: f64) -> u8 {
        (self.zoom + offset).floor().clamp(0.0, f64::from(MAX_ZOOM)) as u8
    }

    /// Width and height of the viewport as fractions of the world map.
    /// The larger viewport side maps to `1 / 2^zoom`.
    pub fn size_norm(&self) -> (f64, f64) {
        let extent = 1.0 / 2f64.powf(self.zoom);
        (
            extent * self.aspect.min(1.0),
            extent * (1.0 / self.aspect).min(1.0),
        )
    }

    /// Distance covered by a single pan step, in world-normalized units.
    /// Shrinks exponentially with zoom so panning feels uniform.
    pub fn pan_step(&self) -> f64 {
        0.1 / 2f64.powf(self.zoom)
    }

    /// Tiles at `map_zoom` whose squares intersect the viewport rectangle.
    ///
    /// Indices are clamped to the grid, so a viewport hanging off the edge
    /// of the map yields only real tiles.
    pub fn visible_tiles(&self, map_zoom: u8) -> Vec<TileCoord> {
        let map_zoom = map_zoom.min(MAX_ZOOM);
        let (width, height) = self.size_norm();

        let min_x = self.center_x - width / 2.0;
        let max_x = self.center_x + width / 2.0;
        let min_y = self.center_y - height / 2.0;
        let max_y = self.center_y + height / 2.0;

        let side = grid_side(map_zoom);
        let to_index =
            |v: f64| ((v * f64::from(side)).floor() as i64).clamp(0, i64::from(side) - 1) as u32;

        let left = to_index(min_x);
        let right = to_index(max_x);
        let top = to_index(min_y);
        let bottom = to_index(max_y);

        let mut tiles = Vec::with_capacity(((right - left + 1) * (bottom - top + 1)) as usize);
        for y in top..=bottom {
            for x in left..=right {
                tiles.push(TileCoord::new(map_zoom, x, y));
            }
        }
        tiles
    }
}

/// Map zoom that renders tiles as close as possible to `desired_tile_px`
/// on a viewport of the given pixel size.
pub fn map_zoom_for_tile_size(
    vp_width_px: u32,
    vp_height_px: u32,
    vp_zoom: f64,
    desired_tile_px: u32,
) -> u8 {
    let current_tile_px = f64::from(vp_width_px.max(vp_height_px));
    let desired_scale = f64::from(desired_tile_px) / current_tile_px;
    (vp_zoom - desired_scale.log2())
        .round()
        .clamp(0.0, f64::from(MAX_ZOOM)) as u8
}

/// Converts longitude and latitude in radians to world-normalized
/// coordinates.
pub fn lon_lat_to_world_norm(lon: f64, lat: f64) -> (f64, f64) {
    use std::f64::consts::{FRAC_PI_4, PI};

    let y = (FRAC_PI_4 + lat / 2.0).tan().ln();
    let y_limit = (FRAC_PI_4 + MERCATOR_PHI_CUTOFF / 2.0).tan().ln();

    (
        normalize(lon, -PI, PI),
        // Mercator y grows northwards while tile y grows southwards.
        normalize(-y, -y_limit, y_limit),
    )
}

/// Degree-based variant of [`lon_lat_to_world_norm`].
pub fn lon_lat_to_world_norm_degrees(lon: f64, lat: f64) -> (f64, f64) {
    lon_lat_to_world_norm(lon.to_radians(), lat.to_radians())
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    const EPSILON: f64 = 1e-4;
    if max - min < EPSILON {
        0.0
    } else {
        (value - min) / (max - min)
    }
}
