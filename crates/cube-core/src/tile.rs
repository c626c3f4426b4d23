//! Raster tile addressing.
//!
//! Raster data is streamed in fixed [`TILE_SIZE`] × [`TILE_SIZE`] tiles of
//! the mip-downsampled image. A tile is addressed by `(layer, x, y)` where
//! the layer encodes the mip: layer 0 is the coarsest level at which the
//! whole image fits one tile, and each deeper layer halves the mip.
//!
//! Loaders that read in larger chunks use [`CHUNK_SIZE`]-aligned addressing;
//! one chunk covers a 2×2 block of tiles.

use serde::{Deserialize, Serialize};

/// Edge length of a raster tile in (downsampled) pixels.
pub const TILE_SIZE: usize = 256;

/// Edge length of a loader chunk in image pixels; always `2 * TILE_SIZE`.
pub const CHUNK_SIZE: usize = 512;

/// Address of one raster tile: pyramid layer plus tile grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    /// Pyramid layer; encodes the mip via [`layer_to_mip`].
    pub layer: i32,
    /// Tile column in the downsampled grid.
    pub x: i32,
    /// Tile row in the downsampled grid.
    pub y: i32,
}

impl Tile {
    /// Creates a tile address.
    pub fn new(layer: i32, x: i32, y: i32) -> Self {
        Self { layer, x, y }
    }

    /// Decodes a packed 32-bit tile encoding `(layer << 24 | y << 12 | x)`
    /// as used on the wire.
    pub fn decode(encoded: i32) -> Self {
        Self {
            layer: (encoded >> 24) & 0x7f,
            y: (encoded >> 12) & 0xfff,
            x: encoded & 0xfff,
        }
    }

    /// Packs the tile address into its 32-bit wire encoding.
    pub fn encode(&self) -> i32 {
        ((self.layer & 0x7f) << 24) | ((self.y & 0xfff) << 12) | (self.x & 0xfff)
    }
}

/// Pixel-coordinate bounds of a raster request, `[x_min, x_max) × [y_min, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageBounds {
    /// Inclusive left edge.
    pub x_min: i32,
    /// Exclusive right edge.
    pub x_max: i32,
    /// Inclusive bottom edge.
    pub y_min: i32,
    /// Exclusive top edge.
    pub y_max: i32,
}

impl ImageBounds {
    /// Creates bounds from edges.
    pub fn new(x_min: i32, x_max: i32, y_min: i32, y_max: i32) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Bounds covering a whole `width × height` image.
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x_min: 0,
            x_max: width as i32,
            y_min: 0,
            y_max: height as i32,
        }
    }

    /// Width of the bounded area.
    #[inline]
    pub fn width(&self) -> i32 {
        self.x_max - self.x_min
    }

    /// Height of the bounded area.
    #[inline]
    pub fn height(&self) -> i32 {
        self.y_max - self.y_min
    }
}

/// Number of pyramid layers for an image: the smallest `n` such that the
/// image fits a single tile at `mip = 2^n`.
fn total_layers(width: usize, height: usize, tile_width: usize, tile_height: usize) -> i32 {
    let tiles_x = width.div_ceil(tile_width);
    let tiles_y = height.div_ceil(tile_height);
    let max_tiles = tiles_x.max(tiles_y) as f64;
    max_tiles.log2().ceil() as i32
}

/// Mip factor of a pyramid layer.
pub fn layer_to_mip(
    layer: i32,
    width: usize,
    height: usize,
    tile_width: usize,
    tile_height: usize,
) -> i32 {
    let layers = total_layers(width, height, tile_width, tile_height);
    2_i32.pow((layers - layer).max(0) as u32)
}

/// Pyramid layer of a mip factor. Inverse of [`layer_to_mip`].
pub fn mip_to_layer(
    mip: i32,
    width: usize,
    height: usize,
    tile_width: usize,
    tile_height: usize,
) -> i32 {
    let layers = total_layers(width, height, tile_width, tile_height);
    layers - (mip.max(1) as f64).log2().round() as i32
}

/// Enumerates the tiles covering the mip-downsampled image.
///
/// The union of the tiles' [`tile_image_bounds`] covers every pixel of
/// `[0, width) × [0, height)` exactly once.
pub fn get_tiles(width: usize, height: usize, mip: i32) -> Vec<Tile> {
    let mip = mip.max(1) as usize;
    let down_width = width.div_ceil(mip);
    let down_height = height.div_ceil(mip);
    let tiles_x = down_width.div_ceil(TILE_SIZE);
    let tiles_y = down_height.div_ceil(TILE_SIZE);
    let layer = mip_to_layer(mip as i32, width, height, TILE_SIZE, TILE_SIZE);

    let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
    for y in 0..tiles_y {
        for x in 0..tiles_x {
            tiles.push(Tile::new(layer, x as i32, y as i32));
        }
    }
    tiles
}

/// Image-pixel bounds of one tile at the given mip, clipped to the image.
pub fn tile_image_bounds(tile: &Tile, width: usize, height: usize, mip: i32) -> ImageBounds {
    let span = (TILE_SIZE as i32) * mip;
    ImageBounds {
        x_min: (tile.x * span).max(0),
        x_max: ((tile.x + 1) * span).min(width as i32),
        y_min: (tile.y * span).max(0),
        y_max: ((tile.y + 1) * span).min(height as i32),
    }
}

/// Rounds an index down to its containing tile (or chunk) origin.
#[inline]
pub fn aligned_index(index: i32, size: usize) -> i32 {
    (index / size as i32) * size as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_mip_round_trip() {
        for (w, h) in [(512_usize, 1024_usize), (1110, 1110), (8000, 4000)] {
            let layers = total_layers(w, h, TILE_SIZE, TILE_SIZE);
            for layer in 0..=layers {
                let mip = layer_to_mip(layer, w, h, TILE_SIZE, TILE_SIZE);
                assert_eq!(
                    mip_to_layer(mip, w, h, TILE_SIZE, TILE_SIZE),
                    layer,
                    "round trip failed for {w}x{h} layer {layer}"
                );
            }
        }
    }

    #[test]
    fn test_get_tiles_covers_image_exactly_once() {
        let (w, h, mip) = (1110, 1110, 4);
        let tiles = get_tiles(w, h, mip);

        let expected = (w.div_ceil(mip as usize)).div_ceil(TILE_SIZE);
        assert_eq!(tiles.len(), expected * expected);

        let mut covered = vec![0u8; w * h];
        for tile in &tiles {
            let b = tile_image_bounds(tile, w, h, mip);
            for y in b.y_min..b.y_max {
                for x in b.x_min..b.x_max {
                    covered[y as usize * w + x as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_tile_bounds_clip_to_image() {
        let tiles = get_tiles(1110, 1110, 4);
        let last = tiles.last().unwrap();
        let b = tile_image_bounds(last, 1110, 1110, 4);
        assert_eq!(b.x_max, 1110);
        assert_eq!(b.y_max, 1110);
        assert!(b.width() > 0 && b.height() > 0);
    }

    #[test]
    fn test_encode_decode() {
        let tile = Tile::new(5, 37, 1023);
        assert_eq!(Tile::decode(tile.encode()), tile);
    }

    #[test]
    fn test_aligned_index() {
        assert_eq!(aligned_index(0, TILE_SIZE), 0);
        assert_eq!(aligned_index(255, TILE_SIZE), 0);
        assert_eq!(aligned_index(256, TILE_SIZE), 256);
        assert_eq!(aligned_index(700, CHUNK_SIZE), 512);
    }
}
