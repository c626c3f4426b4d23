//! Channel and tile caches.
//!
//! Exactly one of the two is authoritative for a frame at a time: loaders
//! with a chunked on-disk layout go through the [`TileCache`], everything
//! else reads whole planes into the [`ChannelCache`]. Computed Stokes
//! always uses the channel cache because its pixels are synthesized.

use cube_core::{aligned_index, Slicer, CHUNK_SIZE, TILE_SIZE};
use cube_io::{FileLoader, IoResult};
use std::collections::HashMap;
use std::sync::Arc;

/// One whole xy plane for a (z, stokes) pair, plus a validity bit.
///
/// The owning frame guards instances with a shared/exclusive lock:
/// readers share, [`set`](ChannelCache::set) and
/// [`invalidate`](ChannelCache::invalidate) run under the exclusive side.
#[derive(Debug, Default)]
pub struct ChannelCache {
    z: usize,
    stokes: i32,
    valid: bool,
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ChannelCache {
    /// Creates an empty, invalid cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the cached plane matches (z, stokes) and is valid.
    pub fn available(&self, z: usize, stokes: i32) -> bool {
        self.valid && self.z == z && self.stokes == stokes
    }

    /// Installs a freshly read plane.
    pub fn set(&mut self, z: usize, stokes: i32, width: usize, height: usize, data: Vec<f32>) {
        self.z = z;
        self.stokes = stokes;
        self.width = width;
        self.height = height;
        self.data = data;
        self.valid = true;
    }

    /// Drops validity without freeing the buffer.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// The cached plane; empty when invalid.
    pub fn data(&self) -> &[f32] {
        if self.valid {
            &self.data
        } else {
            &[]
        }
    }

    /// Constant-time pixel accessor; callers hold the shared lock.
    #[inline]
    pub fn get_value(&self, x: usize, y: usize) -> f32 {
        debug_assert!(self.valid && x < self.width && y < self.height);
        self.data[y * self.width + x]
    }
}

/// Key of one cached tile: tile-aligned (x, y) in image pixels.
pub type TileCacheKey = (i32, i32);

/// Chunk-aligned key containing a tile key.
pub fn chunk_key(key: TileCacheKey) -> TileCacheKey {
    (
        aligned_index(key.0, CHUNK_SIZE),
        aligned_index(key.1, CHUNK_SIZE),
    )
}

/// LRU cache of TILE_SIZE × TILE_SIZE buffers inside a fixed (z, stokes)
/// context. A miss reads the whole containing chunk through the loader
/// and populates its four tiles, because chunked formats store 2×2 tiles
/// contiguously.
pub struct TileCache {
    z: usize,
    stokes: i32,
    capacity: usize,
    clock: u64,
    tiles: HashMap<TileCacheKey, (Arc<Vec<f32>>, u64)>,
}

impl TileCache {
    /// Creates a cache with the given tile capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            z: 0,
            stokes: 0,
            capacity: capacity.max(4),
            clock: 0,
            tiles: HashMap::new(),
        }
    }

    /// Context the cached tiles belong to.
    pub fn context(&self) -> (usize, i32) {
        (self.z, self.stokes)
    }

    /// Drops every tile and pins a new (z, stokes) context.
    pub fn reset(&mut self, z: usize, stokes: i32, capacity: usize) {
        self.z = z;
        self.stokes = stokes;
        self.capacity = capacity.max(4);
        self.tiles.clear();
    }

    /// Width/height of the tile at `key` clipped to the image.
    fn tile_dims(key: TileCacheKey, width: usize, height: usize) -> (usize, usize) {
        let w = TILE_SIZE.min(width.saturating_sub(key.0 as usize));
        let h = TILE_SIZE.min(height.saturating_sub(key.1 as usize));
        (w, h)
    }

    /// Returns the tile at `key`, reading its chunk on a miss.
    ///
    /// The caller already holds the frame's image mutex; the loader is
    /// borrowed for the duration of the chunk read only.
    pub fn get(
        &mut self,
        key: TileCacheKey,
        loader: &mut dyn FileLoader,
        image_width: usize,
        image_height: usize,
    ) -> IoResult<Arc<Vec<f32>>> {
        self.clock += 1;
        if let Some((tile, used)) = self.tiles.get_mut(&key) {
            *used = self.clock;
            return Ok(Arc::clone(tile));
        }

        // read the whole chunk and split it into its tiles
        let origin = chunk_key(key);
        let chunk_w = CHUNK_SIZE.min(image_width.saturating_sub(origin.0 as usize));
        let chunk_h = CHUNK_SIZE.min(image_height.saturating_sub(origin.1 as usize));
        let slicer = Slicer::plane_region(
            origin.0 as usize,
            origin.1 as usize,
            chunk_w,
            chunk_h,
            self.z,
            self.stokes.max(0) as usize,
        );
        let mut chunk = vec![0.0f32; chunk_w * chunk_h];
        loader.get_slice(&mut chunk, &slicer)?;

        for ty in (0..chunk_h).step_by(TILE_SIZE) {
            for tx in (0..chunk_w).step_by(TILE_SIZE) {
                let tile_key = (origin.0 + tx as i32, origin.1 + ty as i32);
                let (tw, th) = Self::tile_dims(tile_key, image_width, image_height);
                let mut tile = Vec::with_capacity(tw * th);
                for row in 0..th {
                    let base = (ty + row) * chunk_w + tx;
                    tile.extend_from_slice(&chunk[base..base + tw]);
                }
                self.insert(tile_key, Arc::new(tile));
            }
        }

        self.tiles
            .get(&key)
            .map(|(tile, _)| Arc::clone(tile))
            .ok_or_else(|| {
                cube_io::IoError::InvalidRegion(format!("tile key {key:?} outside image"))
            })
    }

    fn insert(&mut self, key: TileCacheKey, tile: Arc<Vec<f32>>) {
        while self.tiles.len() >= self.capacity {
            if let Some((&oldest, _)) = self.tiles.iter().min_by_key(|(_, (_, used))| *used) {
                self.tiles.remove(&oldest);
            } else {
                break;
            }
        }
        self.tiles.insert(key, (tile, self.clock));
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Whether the cache holds no tiles.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_core::{CoordinateSystem, ImageShape};
    use cube_io::MemoryLoader;

    fn loader(width: usize, height: usize) -> MemoryLoader {
        let shape = ImageShape::plane(width, height).unwrap();
        let data: Vec<f32> = (0..width * height).map(|i| i as f32).collect();
        MemoryLoader::new("tiles", shape, CoordinateSystem::pixel(), data).unwrap()
    }

    #[test]
    fn test_channel_cache_validity() {
        let mut cache = ChannelCache::new();
        assert!(!cache.available(0, 0));

        cache.set(3, 1, 4, 4, vec![7.0; 16]);
        assert!(cache.available(3, 1));
        assert!(!cache.available(3, 0));
        assert!(!cache.available(2, 1));
        assert_eq!(cache.get_value(1, 2), 7.0);

        cache.invalidate();
        assert!(!cache.available(3, 1));
        assert!(cache.data().is_empty());
    }

    #[test]
    fn test_tile_cache_miss_reads_chunk() {
        let mut loader = loader(600, 600);
        let mut cache = TileCache::new(16);
        cache.reset(0, 0, 16);

        let tile = cache.get((0, 0), &mut loader, 600, 600).unwrap();
        assert_eq!(tile.len(), TILE_SIZE * TILE_SIZE);
        assert_eq!(tile[0], 0.0);
        assert_eq!(tile[1], 1.0);
        // a chunk read populates sibling tiles too
        assert_eq!(cache.len(), 4);

        let sibling = cache.get((256, 0), &mut loader, 600, 600).unwrap();
        assert_eq!(sibling[0], 256.0);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_tile_cache_edge_tiles_clipped() {
        let mut loader = loader(600, 600);
        let mut cache = TileCache::new(16);
        cache.reset(0, 0, 16);

        // chunk at (512, 512) covers 88x88 pixels: one 88-wide tile
        let tile = cache.get((512, 512), &mut loader, 600, 600).unwrap();
        assert_eq!(tile.len(), 88 * 88);
        assert_eq!(tile[0], (512 * 600 + 512) as f32);
    }

    #[test]
    fn test_tile_cache_eviction() {
        let mut loader = loader(2048, 2048);
        let mut cache = TileCache::new(4);
        cache.reset(0, 0, 4);

        cache.get((0, 0), &mut loader, 2048, 2048).unwrap();
        cache.get((512, 0), &mut loader, 2048, 2048).unwrap();
        cache.get((1024, 0), &mut loader, 2048, 2048).unwrap();
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_chunk_key_alignment() {
        assert_eq!(chunk_key((256, 256)), (0, 0));
        assert_eq!(chunk_key((512, 768)), (512, 512));
    }
}
