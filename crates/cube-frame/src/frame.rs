//! The per-file compute frame.
//!
//! A [`Frame`] owns one opened image through its loader, the channel and
//! tile caches, the current (z, stokes) position and cursor, and the
//! per-file requirement sets. Every call into the loader is serialized by
//! the loader mutex because the underlying format libraries are not
//! reentrant for a single file handle.
//!
//! Long-running producers (spectral profiles, contours, generators) hold
//! the active-task lock shared and poll the connected flag plus their
//! cancellation keys before every slice; `wait_for_task_cancellation`
//! flips the flag and then drains the lock exclusively.

use crate::cache::{ChannelCache, TileCache};
use cube_core::messages::{
    CompressionType, RasterTileData, StatsType, StatsValue, TileData, TilePayload,
};
use cube_core::requests::{HistogramConfig, SpatialConfig, SpectralConfig, StatsConfig};
use cube_core::{
    is_computed_stokes, layer_to_mip, parse_coordinate, tile_image_bounds, ComputedStokes,
    CoordinateSystem, Error, ImageBounds, ImageShape, ProfileAxis, Result, Slicer,
    StokesSelector, StokesType, Tile, ALL_Z, CURRENT_Z, HIGH_COMPRESSION_QUALITY,
    MAX_TILE_CACHE_CAPACITY, TILE_SIZE,
};
use cube_io::FileLoader;
use cube_kernels::{block_smooth, compress, encode_nans_block, nearest_neighbor};
use cube_region::StokesRegion;
use cube_stats::{auto_bin_size, calc_basic_stats, calc_histogram, BasicStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Floating-point cursor position; equality is structural and is the
/// cancellation token of cursor profiles.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointXy {
    /// Cursor x in image pixels.
    pub x: f64,
    /// Cursor y in image pixels.
    pub y: f64,
}

impl PointXy {
    /// Creates a point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether the point addresses a pixel of a `width × height` image.
    pub fn in_image(&self, width: usize, height: usize) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.x < width as f64 && self.y < height as f64
    }

    /// Rounds to pixel indices.
    pub fn to_index(&self) -> (usize, usize) {
        (self.x.round().max(0.0) as usize, self.y.round().max(0.0) as usize)
    }
}

pub(crate) struct VectorFieldCache {
    pub settings: Option<cube_core::requests::VectorFieldSettings>,
    pub z: usize,
    pub tiles: Vec<cube_core::messages::VectorOverlayTileData>,
}

/// Per-file compute engine over one opened image.
pub struct Frame {
    file_id: i32,
    shape: ImageShape,
    csys: CoordinateSystem,
    stokes_types: Vec<Option<StokesType>>,
    beam_area: Option<f64>,
    uses_tile_cache: bool,

    /// The image mutex: serializes every loader call for this file.
    loader: Mutex<Box<dyn FileLoader>>,

    connected: AtomicBool,
    active_task_lock: RwLock<()>,

    z: AtomicUsize,
    stokes: AtomicI32,
    cursor: Mutex<PointXy>,

    channel_cache: RwLock<ChannelCache>,
    tile_cache: Mutex<TileCache>,

    pub(crate) spatial_configs: Mutex<Vec<SpatialConfig>>,
    pub(crate) spectral_configs: Mutex<Vec<SpectralConfig>>,
    histogram_configs: Mutex<Vec<HistogramConfig>>,
    stats_configs: Mutex<Vec<StatsConfig>>,
    pub(crate) contour_settings: Mutex<cube_core::requests::ContourSettings>,

    stats_cache: Mutex<HashMap<(usize, i32), BasicStats>>,
    histogram_cache: Mutex<HashMap<(usize, i32, usize), cube_core::messages::HistogramData>>,
    cube_stats_cache: Mutex<HashMap<i32, BasicStats>>,
    region_stats_cache: Mutex<HashMap<(usize, i32), Vec<StatsValue>>>,

    pub(crate) vector_field: Mutex<VectorFieldCache>,
    pub(crate) moment_stop: AtomicBool,
    pub(crate) fitting_stop: AtomicBool,

    /// Best-effort latch: while held, the tile-stitched spatial profile
    /// ignores cursor-moved interrupts.
    pub(crate) spatial_interrupt_latch: Mutex<()>,
}

impl Frame {
    /// Opens the image through its loader and validates the shape.
    pub fn new(file_id: i32, mut loader: Box<dyn FileLoader>, hdu: &str) -> Result<Self> {
        loader.open_file(hdu).map_err(cube_core::Error::from)?;
        let shape = loader.shape().clone();
        let csys = loader.coordinate_system(&cube_core::StokesSource::Original);
        let stokes_types = (0..shape.num_stokes())
            .map(|i| loader.stokes_type_at(i))
            .collect();
        let beam_area = loader.beam_area();
        let uses_tile_cache = loader.use_tile_cache();

        let tiles_x = shape.width().div_ceil(TILE_SIZE);
        let tiles_y = shape.height().div_ceil(TILE_SIZE);
        let tile_capacity = MAX_TILE_CACHE_CAPACITY.min(2 * (tiles_x + tiles_y));

        tracing::debug!(
            "frame {} opened {} ({:?})",
            file_id,
            loader.file_name(),
            shape.dims()
        );

        Ok(Self {
            file_id,
            shape,
            csys,
            stokes_types,
            beam_area,
            uses_tile_cache,
            loader: Mutex::new(loader),
            connected: AtomicBool::new(true),
            active_task_lock: RwLock::new(()),
            z: AtomicUsize::new(0),
            stokes: AtomicI32::new(0),
            cursor: Mutex::new(PointXy::default()),
            channel_cache: RwLock::new(ChannelCache::new()),
            tile_cache: Mutex::new(TileCache::new(tile_capacity)),
            spatial_configs: Mutex::new(Vec::new()),
            spectral_configs: Mutex::new(Vec::new()),
            histogram_configs: Mutex::new(Vec::new()),
            stats_configs: Mutex::new(Vec::new()),
            contour_settings: Mutex::new(Default::default()),
            stats_cache: Mutex::new(HashMap::new()),
            histogram_cache: Mutex::new(HashMap::new()),
            cube_stats_cache: Mutex::new(HashMap::new()),
            region_stats_cache: Mutex::new(HashMap::new()),
            vector_field: Mutex::new(VectorFieldCache {
                settings: None,
                z: 0,
                tiles: Vec::new(),
            }),
            moment_stop: AtomicBool::new(false),
            fitting_stop: AtomicBool::new(false),
            spatial_interrupt_latch: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // Identity and geometry

    /// Session file id.
    pub fn file_id(&self) -> i32 {
        self.file_id
    }

    /// Image shape with axis roles.
    pub fn shape(&self) -> &ImageShape {
        &self.shape
    }

    /// Spatial width.
    pub fn width(&self) -> usize {
        self.shape.width()
    }

    /// Spatial height.
    pub fn height(&self) -> usize {
        self.shape.height()
    }

    /// Spectral depth (1 when no spectral axis).
    pub fn depth(&self) -> usize {
        self.shape.depth()
    }

    /// Number of real Stokes planes.
    pub fn num_stokes(&self) -> usize {
        self.shape.num_stokes()
    }

    /// The frame's coordinate system.
    pub fn coordinate_system(&self) -> &CoordinateSystem {
        &self.csys
    }

    /// Beam area in pixels, when the header carries a beam.
    pub fn beam_area(&self) -> Option<f64> {
        self.beam_area
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Whether the frame is still connected to a session.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Shared lock held by long-running tasks using this frame.
    pub fn active_task_lock(&self) -> &RwLock<()> {
        &self.active_task_lock
    }

    /// Flags disconnection, then blocks until every long task releases
    /// the active-task lock.
    pub fn wait_for_task_cancellation(&self) {
        self.connected.store(false, Ordering::Release);
        self.stop_moment_calc();
        self.stop_fitting();
        drop(self.active_task_lock.write().expect("active task lock"));
    }

    // ------------------------------------------------------------------
    // Channel / Stokes / cursor state

    /// Current channel.
    pub fn current_z(&self) -> usize {
        self.z.load(Ordering::Acquire)
    }

    /// Current Stokes index (may be computed).
    pub fn current_stokes(&self) -> i32 {
        self.stokes.load(Ordering::Acquire)
    }

    /// True when (z, stokes) differ from the frame's current pair.
    pub fn z_stokes_changed(&self, z: usize, stokes: i32) -> bool {
        self.current_z() != z || self.current_stokes() != stokes
    }

    /// Validates a channel index.
    pub fn check_z(&self, z: i32) -> Result<usize> {
        if z >= 0 && (z as usize) < self.depth() {
            Ok(z as usize)
        } else {
            Err(Error::out_of_range("channel", z as i64, self.depth() as i64))
        }
    }

    /// Validates a Stokes index (real or computed).
    pub fn check_stokes(&self, stokes: i32) -> Result<i32> {
        if is_computed_stokes(stokes) {
            if ComputedStokes::from_index(stokes).is_some() {
                return Ok(stokes);
            }
        } else if stokes >= 0 && (stokes as usize) < self.num_stokes() {
            return Ok(stokes);
        }
        Err(Error::out_of_range(
            "stokes",
            stokes as i64,
            self.num_stokes() as i64,
        ))
    }

    /// Changes the current channel and Stokes.
    ///
    /// Returns `Ok(true)` when either changed; out-of-range requests fail
    /// without touching state. A change invalidates the channel cache,
    /// resets the tile cache, and reloads the channel for channel-cached
    /// frames (computed Stokes always reloads).
    pub fn set_image_channels(&self, new_z: i32, new_stokes: i32) -> Result<bool> {
        if !self.is_connected() {
            return Err(Error::internal("frame is disconnected"));
        }
        let new_z = self.check_z(new_z)?;
        let new_stokes = self.check_stokes(new_stokes)?;
        if !self.z_stokes_changed(new_z, new_stokes) {
            return Ok(false);
        }

        self.z.store(new_z, Ordering::Release);
        self.stokes.store(new_stokes, Ordering::Release);
        self.invalidate_image_cache();
        self.region_stats_cache.lock().expect("stats cache").clear();

        let computed = is_computed_stokes(new_stokes);
        if self.uses_tile_cache && !computed {
            let tiles_x = self.width().div_ceil(TILE_SIZE);
            let tiles_y = self.height().div_ceil(TILE_SIZE);
            let capacity = MAX_TILE_CACHE_CAPACITY.min(2 * (tiles_x + tiles_y));
            self.tile_cache
                .lock()
                .expect("tile cache")
                .reset(new_z, new_stokes, capacity);
        } else {
            self.fill_image_cache()?;
        }
        Ok(true)
    }

    /// Moves the cursor. Returns `true` when the position changed; a
    /// change cancels in-flight cursor profiles by snapshot inequality.
    pub fn set_cursor(&self, x: f64, y: f64) -> bool {
        let mut cursor = self.cursor.lock().expect("cursor");
        let new = PointXy::new(x, y);
        if *cursor == new {
            false
        } else {
            *cursor = new;
            true
        }
    }

    /// Snapshot of the cursor.
    pub fn cursor(&self) -> PointXy {
        *self.cursor.lock().expect("cursor")
    }

    // ------------------------------------------------------------------
    // Channel cache

    /// Whether the channel cache currently holds the frame's plane.
    pub fn image_cache_available(&self) -> bool {
        let cache = self.channel_cache.read().expect("channel cache");
        cache.available(self.current_z(), self.current_stokes())
    }

    /// Loads the current plane into the channel cache (exclusive lock).
    pub fn fill_image_cache(&self) -> Result<()> {
        let (z, stokes) = (self.current_z(), self.current_stokes());
        {
            let cache = self.channel_cache.read().expect("channel cache");
            if cache.available(z, stokes) {
                return Ok(());
            }
        }
        let data = self.get_z_matrix(z, stokes)?;
        let mut cache = self.channel_cache.write().expect("channel cache");
        cache.set(z, stokes, self.width(), self.height(), data);
        Ok(())
    }

    /// Drops channel-cache validity without freeing memory.
    pub fn invalidate_image_cache(&self) {
        self.channel_cache
            .write()
            .expect("channel cache")
            .invalidate();
    }

    /// Runs `f` under the shared channel-cache lock.
    pub(crate) fn with_channel_cache<R>(&self, f: impl FnOnce(&ChannelCache) -> R) -> R {
        let cache = self.channel_cache.read().expect("channel cache");
        f(&cache)
    }

    /// Runs `f` with the loader under the image mutex.
    pub fn with_loader<R>(&self, f: impl FnOnce(&mut dyn FileLoader) -> R) -> R {
        let mut loader = self.loader.lock().expect("image mutex");
        f(loader.as_mut())
    }

    /// Whether reads go through the chunked tile cache.
    pub fn uses_tile_cache(&self) -> bool {
        self.uses_tile_cache
    }

    /// One tile from the tile cache, reading its chunk on a miss.
    pub(crate) fn get_cached_tile(
        &self,
        key: (i32, i32),
    ) -> Result<std::sync::Arc<Vec<f32>>> {
        let mut cache = self.tile_cache.lock().expect("tile cache");
        self.with_loader(|loader| cache.get(key, loader, self.width(), self.height()))
            .map_err(Error::from)
    }

    // ------------------------------------------------------------------
    // Pixel access

    /// Reads one whole xy plane, synthesizing computed Stokes.
    pub fn get_z_matrix(&self, z: usize, stokes: i32) -> Result<Vec<f32>> {
        let slicer = Slicer::plane(&self.shape, z, 0);
        self.get_slice_data(&slicer, stokes)
    }

    /// Reads a hyper-rectangle at a (possibly computed) Stokes index.
    ///
    /// The slicer's own stokes component is ignored in favour of `stokes`.
    pub fn get_slice_data(&self, slicer: &Slicer, stokes: i32) -> Result<Vec<f32>> {
        if let Some(computed) = ComputedStokes::from_index(stokes) {
            return self.get_computed_slice(slicer, computed);
        }
        let mut fixed = *slicer;
        fixed.start[3] = stokes.max(0) as usize;
        fixed.count[3] = 1;

        let mut buf = vec![0.0f32; fixed.length()];
        self.with_loader(|loader| loader.get_slice(&mut buf, &fixed))
            .map_err(Error::from)?;
        Ok(buf)
    }

    /// Synthesizes a computed-Stokes slice from the real planes.
    fn get_computed_slice(&self, slicer: &Slicer, computed: ComputedStokes) -> Result<Vec<f32>> {
        let mut components: HashMap<StokesType, Vec<f32>> = HashMap::new();
        for stokes_type in computed.required_components() {
            let index = self.stokes_index_of(*stokes_type)?;
            components.insert(*stokes_type, self.get_slice_data(slicer, index)?);
        }
        Ok(combine_computed_stokes(computed, &components))
    }

    /// Position of a Stokes type on the image's Stokes axis.
    pub fn stokes_index_of(&self, stokes_type: StokesType) -> Result<i32> {
        self.stokes_types
            .iter()
            .position(|t| *t == Some(stokes_type))
            .map(|i| i as i32)
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "image has no Stokes {}",
                    stokes_type.label()
                ))
            })
    }

    /// Resolves a profile coordinate to a Stokes index; `None` selector
    /// means the frame's current Stokes.
    pub fn get_stokes_type_index(&self, coordinate: &str) -> Result<i32> {
        let parsed = parse_coordinate(coordinate).ok_or_else(|| {
            Error::invalid_request(format!("bad coordinate {coordinate:?}"))
        })?;
        match parsed.stokes {
            None => Ok(self.current_stokes()),
            Some(StokesSelector::Real(t)) => self.stokes_index_of(t),
            Some(StokesSelector::Computed(c)) => Ok(c.index()),
        }
    }

    /// Profile axis of a coordinate string.
    pub fn profile_axis(coordinate: &str) -> Result<ProfileAxis> {
        parse_coordinate(coordinate)
            .map(|c| c.axis)
            .ok_or_else(|| Error::invalid_request(format!("bad coordinate {coordinate:?}")))
    }

    // ------------------------------------------------------------------
    // Raster data

    /// Downsamples the cached channel over `bounds` at `mip`.
    ///
    /// Mean filtering runs the NaN-aware block mean; otherwise nearest
    /// neighbour. Output is `ceil(w / mip) × ceil(h / mip)`.
    pub fn get_raster_data(
        &self,
        bounds: &ImageBounds,
        mip: i32,
        mean_filter: bool,
    ) -> Result<(Vec<f32>, usize, usize)> {
        if mip <= 0 {
            return Err(Error::invalid_request("mip must be positive"));
        }
        let (x, y) = (bounds.x_min, bounds.y_min);
        let (req_width, req_height) = (bounds.width(), bounds.height());
        if req_width < 0 || req_height < 0 || x < 0 || y < 0 {
            return Err(Error::invalid_request("negative raster bounds"));
        }
        if (y + req_height) as usize > self.height() || (x + req_width) as usize > self.width()
        {
            return Err(Error::invalid_request("raster bounds exceed image"));
        }

        self.fill_image_cache()?;
        let mip_u = mip as usize;
        let rows = (req_height as usize).div_ceil(mip_u);
        let row_length = (req_width as usize).div_ceil(mip_u);
        let mut data = vec![0.0f32; rows * row_length];

        let start = std::time::Instant::now();
        self.with_channel_cache(|cache| {
            if mean_filter && mip > 1 {
                block_smooth(
                    cache.data(),
                    &mut data,
                    self.width(),
                    self.height(),
                    row_length,
                    rows,
                    x as usize,
                    y as usize,
                    mip_u,
                );
            } else {
                nearest_neighbor(
                    cache.data(),
                    &mut data,
                    self.width(),
                    row_length,
                    rows,
                    x as usize,
                    y as usize,
                    mip_u,
                );
            }
        });
        tracing::debug!(
            "{} filter {}x{} -> {}x{} in {:.3} ms",
            if mean_filter && mip > 1 { "mean" } else { "nearest" },
            req_width,
            req_height,
            row_length,
            rows,
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok((data, row_length, rows))
    }

    /// Reads the downsampled pixels of one tile, preferring loader
    /// mipmaps, then the tile cache, then the channel cache.
    pub fn get_raster_tile_data(&self, tile: &Tile) -> Result<(Vec<f32>, usize, usize)> {
        let mip = layer_to_mip(tile.layer, self.width(), self.height(), TILE_SIZE, TILE_SIZE);
        let bounds = tile_image_bounds(tile, self.width(), self.height(), mip);
        if bounds.width() <= 0 || bounds.height() <= 0 {
            return Err(Error::invalid_request("tile outside image"));
        }
        let out_w = (bounds.width() as usize).div_ceil(mip as usize);
        let out_h = (bounds.height() as usize).div_ceil(mip as usize);

        // stored mipmap fast path
        if mip > 1 {
            let (z, stokes) = (self.current_z(), self.current_stokes());
            if !is_computed_stokes(stokes) {
                let fast = self.with_loader(|loader| {
                    if loader.has_mip(mip) {
                        let mut buf = Vec::new();
                        loader
                            .get_downsampled_raster_data(
                                &mut buf,
                                z,
                                stokes as usize,
                                &bounds,
                                mip,
                            )
                            .ok()
                            .map(|_| buf)
                    } else {
                        None
                    }
                });
                if let Some(buf) = fast {
                    return Ok((buf, out_w, out_h));
                }
            }
        }

        // chunked-loader path: stitch full-res tiles, then downsample
        if self.uses_tile_cache && !is_computed_stokes(self.current_stokes()) {
            let full =
                self.stitch_tiles(&bounds)?;
            if mip > 1 {
                let full_w = bounds.width() as usize;
                let full_h = bounds.height() as usize;
                let mut down = vec![0.0f32; out_w * out_h];
                block_smooth(&full, &mut down, full_w, full_h, out_w, out_h, 0, 0, mip as usize);
                return Ok((down, out_w, out_h));
            }
            return Ok((full, out_w, out_h));
        }

        let (data, w, h) = self.get_raster_data(&bounds, mip, true)?;
        Ok((data, w, h))
    }

    /// Assembles a full-resolution rectangle from cached tiles.
    fn stitch_tiles(&self, bounds: &ImageBounds) -> Result<Vec<f32>> {
        let (w, h) = (bounds.width() as usize, bounds.height() as usize);
        let mut out = vec![f32::NAN; w * h];
        let mut cache = self.tile_cache.lock().expect("tile cache");

        let mut ty = cube_core::aligned_index(bounds.y_min, TILE_SIZE);
        while ty < bounds.y_max {
            let mut tx = cube_core::aligned_index(bounds.x_min, TILE_SIZE);
            while tx < bounds.x_max {
                let tile = self.with_loader(|loader| {
                    cache.get((tx, ty), loader, self.width(), self.height())
                })?;
                let tile_w = TILE_SIZE.min(self.width() - tx as usize);

                let copy_x0 = bounds.x_min.max(tx) as usize;
                let copy_x1 = bounds
                    .x_max
                    .min(tx + TILE_SIZE as i32)
                    .min(self.width() as i32) as usize;
                let copy_y0 = bounds.y_min.max(ty) as usize;
                let copy_y1 = bounds
                    .y_max
                    .min(ty + TILE_SIZE as i32)
                    .min(self.height() as i32) as usize;
                for y in copy_y0..copy_y1 {
                    let src = (y - ty as usize) * tile_w + (copy_x0 - tx as usize);
                    let dst = (y - bounds.y_min as usize) * w
                        + (copy_x0 - bounds.x_min as usize);
                    let len = copy_x1 - copy_x0;
                    out[dst..dst + len].copy_from_slice(&tile[src..src + len]);
                }
                tx += TILE_SIZE as i32;
            }
            ty += TILE_SIZE as i32;
        }
        Ok(out)
    }

    /// Produces one raster tile message, compressing per the request.
    ///
    /// Returns `Cancelled` when (z, stokes) is superseded before the tile
    /// finishes; the caller discards silently.
    pub fn fill_raster_tile_data(
        &self,
        tile: &Tile,
        z: usize,
        stokes: i32,
        compression_type: CompressionType,
        compression_quality: f32,
    ) -> Result<RasterTileData> {
        if self.z_stokes_changed(z, stokes) {
            return Err(Error::cancelled("raster tile"));
        }
        let (tile_data, width, height) = self.get_raster_tile_data(tile)?;
        if self.z_stokes_changed(z, stokes) {
            return Err(Error::cancelled("raster tile"));
        }
        let mip = layer_to_mip(tile.layer, self.width(), self.height(), TILE_SIZE, TILE_SIZE);

        let mut message = RasterTileData {
            file_id: self.file_id,
            channel: z,
            stokes,
            compression_type,
            compression_quality,
            tiles: Vec::with_capacity(1),
        };

        match compression_type {
            CompressionType::None => {
                message.tiles.push(TileData {
                    layer: tile.layer,
                    x: tile.x,
                    y: tile.y,
                    width,
                    height,
                    mip,
                    payload: TilePayload::Raw(tile_data),
                });
            }
            CompressionType::Zfp => {
                let raw_bytes = tile_data.len() * std::mem::size_of::<f32>();
                let mut blanked = tile_data;
                let nan_encodings = encode_nans_block(&mut blanked, 0, width, height);
                if self.z_stokes_changed(z, stokes) {
                    return Err(Error::cancelled("raster tile"));
                }

                let start = std::time::Instant::now();
                let precision = compression_quality.round() as i32;
                let mut compressed =
                    compress(&blanked, width, height, precision.max(1) as u32);
                let mut used_quality = compression_quality;
                let ratio = raw_bytes as f32 / compressed.len().max(1) as f32;

                if precision < HIGH_COMPRESSION_QUALITY && ratio > 20.0 {
                    // the requested quality over-compressed; retry high quality
                    let hq = compress(
                        &blanked,
                        width,
                        height,
                        HIGH_COMPRESSION_QUALITY as u32,
                    );
                    let hq_ratio = raw_bytes as f32 / hq.len().max(1) as f32;
                    if hq_ratio > 10.0 {
                        tracing::debug!(
                            "escalating tile compression, ratio {:.1} -> {:.1}",
                            ratio,
                            hq_ratio
                        );
                        compressed = hq;
                        used_quality = HIGH_COMPRESSION_QUALITY as f32;
                    }
                }
                tracing::debug!(
                    "compressed {}x{} tile in {:.3} ms",
                    width,
                    height,
                    start.elapsed().as_secs_f64() * 1e3
                );

                message.compression_quality = used_quality;
                message.tiles.push(TileData {
                    layer: tile.layer,
                    x: tile.x,
                    y: tile.y,
                    width,
                    height,
                    mip,
                    payload: TilePayload::Compressed {
                        data: compressed,
                        nan_encodings,
                    },
                });
            }
        }

        if self.z_stokes_changed(z, stokes) {
            return Err(Error::cancelled("raster tile"));
        }
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Histograms and stats (file scope)

    /// Replaces the frame's histogram requirements.
    pub fn set_histogram_requirements(&self, configs: Vec<HistogramConfig>) {
        *self.histogram_configs.lock().expect("histogram configs") = configs;
    }

    /// The frame's histogram requirements.
    pub fn histogram_configs(&self) -> Vec<HistogramConfig> {
        self.histogram_configs
            .lock()
            .expect("histogram configs")
            .clone()
    }

    /// Bin count of the AUTO sentinel for this image.
    pub fn auto_bin_count(&self) -> usize {
        auto_bin_size(self.width(), self.height())
    }

    /// Basic statistics of one plane, computed once and cached.
    pub fn get_basic_stats(&self, z: usize, stokes: i32) -> Result<BasicStats> {
        if let Some(stats) = self
            .stats_cache
            .lock()
            .expect("stats cache")
            .get(&(z, stokes))
        {
            return Ok(*stats);
        }

        // loader-carried stats avoid reading the plane at all
        if !is_computed_stokes(stokes) {
            let loader_stats =
                self.with_loader(|loader| loader.get_image_stats(stokes.max(0) as usize, z));
            if let Some(stats) = loader_stats {
                self.stats_cache
                    .lock()
                    .expect("stats cache")
                    .insert((z, stokes), stats.basic);
                return Ok(stats.basic);
            }
        }

        let data = self.channel_data_or_slice(z, stokes)?;
        let stats = calc_basic_stats(&data);
        self.stats_cache
            .lock()
            .expect("stats cache")
            .insert((z, stokes), stats);
        Ok(stats)
    }

    /// Cube-wide statistics for one Stokes, cached.
    pub fn get_cube_basic_stats(&self, stokes: i32) -> Result<BasicStats> {
        if let Some(stats) = self
            .cube_stats_cache
            .lock()
            .expect("cube stats cache")
            .get(&stokes)
        {
            return Ok(*stats);
        }
        let slicer = Slicer::new(
            [0, 0, 0, 0],
            [self.width(), self.height(), self.depth(), 1],
        );
        let data = self.get_slice_data(&slicer, stokes)?;
        let stats = calc_basic_stats(&data);
        self.cube_stats_cache
            .lock()
            .expect("cube stats cache")
            .insert(stokes, stats);
        Ok(stats)
    }

    /// Histogram submessage for one config, preferring loader-carried
    /// histograms, then the frame cache, then computation.
    pub fn fill_histogram(
        &self,
        config: &HistogramConfig,
    ) -> Result<cube_core::messages::HistogramData> {
        let stokes = self.get_stokes_type_index(&config.coordinate)?;
        let num_bins = if config.num_bins <= 0 {
            self.auto_bin_count()
        } else {
            config.num_bins as usize
        };

        if config.channel == ALL_Z {
            return self.cube_histogram(stokes, num_bins);
        }
        let z = if config.channel == CURRENT_Z {
            self.current_z()
        } else {
            self.check_z(config.channel)?
        };

        // loader-carried histogram: usable when the bin count matches
        if config.bounds.is_none() && !is_computed_stokes(stokes) {
            let loader_stats =
                self.with_loader(|loader| loader.get_image_stats(stokes.max(0) as usize, z));
            if let Some(stats) = loader_stats {
                if let Some(histogram) = stats.histogram {
                    if histogram.num_bins == num_bins || config.num_bins <= 0 {
                        return Ok(histogram);
                    }
                }
            }
        }

        let key = (z, stokes, num_bins);
        if config.bounds.is_none() {
            if let Some(cached) = self
                .histogram_cache
                .lock()
                .expect("histogram cache")
                .get(&key)
            {
                return Ok(cached.clone());
            }
        }

        let data = self.channel_data_or_slice(z, stokes)?;
        let stats = self.get_basic_stats(z, stokes)?;
        let histogram = match config.bounds {
            Some((min, max)) => {
                cube_stats::Histogram::new(num_bins, min, max, &data).results(&stats)
            }
            None => calc_histogram(num_bins, &stats, &data),
        };
        if config.bounds.is_none() {
            self.histogram_cache
                .lock()
                .expect("histogram cache")
                .insert(key, histogram.clone());
        }
        Ok(histogram)
    }

    /// Produces one histogram message per image-scope requirement.
    pub fn fill_region_histogram_data(
        &self,
        mut callback: impl FnMut(cube_core::messages::RegionHistogramData),
    ) -> Result<bool> {
        let configs = self.histogram_configs();
        if configs.is_empty() {
            return Ok(false);
        }
        for config in configs {
            let stokes = self.get_stokes_type_index(&config.coordinate)?;
            let channel = if config.channel == ALL_Z {
                ALL_Z
            } else if config.channel == CURRENT_Z {
                self.current_z() as i32
            } else {
                self.check_z(config.channel)? as i32
            };
            let histogram = self.fill_histogram(&config)?;
            callback(cube_core::messages::RegionHistogramData {
                file_id: self.file_id,
                region_id: cube_core::IMAGE_REGION_ID,
                channel,
                stokes,
                progress: 1.0,
                histogram,
            });
        }
        Ok(true)
    }

    fn cube_histogram(
        &self,
        stokes: i32,
        num_bins: usize,
    ) -> Result<cube_core::messages::HistogramData> {
        let stats = self.get_cube_basic_stats(stokes)?;
        let slicer = Slicer::new(
            [0, 0, 0, 0],
            [self.width(), self.height(), self.depth(), 1],
        );
        let data = self.get_slice_data(&slicer, stokes)?;
        Ok(calc_histogram(num_bins, &stats, &data))
    }

    /// Plane pixels: the channel cache when it matches, else a slice.
    pub(crate) fn channel_data_or_slice(&self, z: usize, stokes: i32) -> Result<Vec<f32>> {
        let cached = self.with_channel_cache(|cache| {
            cache.available(z, stokes).then(|| cache.data().to_vec())
        });
        match cached {
            Some(data) => Ok(data),
            None => self.get_z_matrix(z, stokes),
        }
    }

    // ------------------------------------------------------------------
    // Region stats (file scope: the whole current plane)

    /// Replaces the frame's stats requirements.
    pub fn set_stats_requirements(&self, configs: Vec<StatsConfig>) {
        *self.stats_configs.lock().expect("stats configs") = configs;
    }

    /// Produces the per-plane statistics for every stats requirement.
    pub fn fill_region_stats_data(
        &self,
        mut callback: impl FnMut(cube_core::messages::RegionStatsData),
    ) -> Result<()> {
        let configs = self.stats_configs.lock().expect("stats configs").clone();
        if configs.is_empty() {
            return Ok(());
        }
        let z = self.current_z();
        for config in configs {
            let stokes = self.get_stokes_type_index(&config.coordinate)?;

            let cached = self
                .region_stats_cache
                .lock()
                .expect("region stats cache")
                .get(&(z, stokes))
                .cloned();
            let statistics = match cached {
                Some(values) => values,
                None => {
                    let values = self.compute_plane_stats(z, stokes, &config.stats_types)?;
                    self.region_stats_cache
                        .lock()
                        .expect("region stats cache")
                        .insert((z, stokes), values.clone());
                    values
                }
            };

            callback(cube_core::messages::RegionStatsData {
                file_id: self.file_id,
                region_id: cube_core::IMAGE_REGION_ID,
                channel: z as i32,
                stokes,
                statistics,
            });
        }
        Ok(())
    }

    fn compute_plane_stats(
        &self,
        z: usize,
        stokes: i32,
        stats_types: &[StatsType],
    ) -> Result<Vec<StatsValue>> {
        let data = self.channel_data_or_slice(z, stokes)?;
        let lattice = cube_stats::RegionLattice {
            data: &data,
            width: self.width(),
            height: self.height(),
            num_z: 1,
            mask: None,
            origin: (0, 0),
            beam_area: self.beam_area,
        };
        let values = cube_stats::calc_stats_values(&lattice, stats_types, false);
        Ok(stats_types
            .iter()
            .map(|&stats_type| StatsValue {
                stats_type,
                value: values
                    .get(&stats_type)
                    .and_then(|v| v.first().copied())
                    .unwrap_or(f64::NAN),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Region sub-lattices (used by the handler)

    /// Reads the dense sub-lattice under a region mask for a z range.
    pub fn get_region_data(&self, region: &StokesRegion) -> Result<Vec<f32>> {
        let num_z = region.z_to - region.z_from + 1;
        let slicer = Slicer::new(
            [region.mask.origin.0, region.mask.origin.1, region.z_from, 0],
            [region.mask.width, region.mask.height, num_z, 1],
        );
        self.get_slice_data(&slicer, region.stokes)
    }

    /// Computes statistics over a region, optionally per channel.
    pub fn get_region_stats(
        &self,
        region: &StokesRegion,
        stats_types: &[StatsType],
        per_z: bool,
    ) -> Result<HashMap<StatsType, Vec<f64>>> {
        let data = self.get_region_data(region)?;
        let lattice = cube_stats::RegionLattice {
            data: &data,
            width: region.mask.width,
            height: region.mask.height,
            num_z: region.z_to - region.z_from + 1,
            mask: Some(&region.mask.mask),
            origin: region.mask.origin,
            beam_area: self.beam_area,
        };
        Ok(cube_stats::calc_stats_values(&lattice, stats_types, per_z))
    }

    /// Stops an in-flight moment computation.
    pub fn stop_moment_calc(&self) {
        self.moment_stop.store(true, Ordering::Release);
    }

    /// Stops an in-flight fit.
    pub fn stop_fitting(&self) {
        self.fitting_stop.store(true, Ordering::Release);
    }
}

/// Combines real Stokes planes into a computed quantity, propagating NaN.
pub fn combine_computed_stokes(
    computed: ComputedStokes,
    components: &HashMap<StokesType, Vec<f32>>,
) -> Vec<f32> {
    let get = |t: StokesType| components.get(&t).map(|v| v.as_slice()).unwrap_or(&[]);
    let (i, q, u, v) = (
        get(StokesType::I),
        get(StokesType::Q),
        get(StokesType::U),
        get(StokesType::V),
    );
    let len = components.values().map(|c| c.len()).max().unwrap_or(0);

    (0..len)
        .map(|idx| {
            let qi = q.get(idx).copied().unwrap_or(f32::NAN);
            let ui = u.get(idx).copied().unwrap_or(f32::NAN);
            match computed {
                ComputedStokes::Ptotal => {
                    let vi = v.get(idx).copied().unwrap_or(f32::NAN);
                    (qi * qi + ui * ui + vi * vi).sqrt()
                }
                ComputedStokes::PFtotal => {
                    let vi = v.get(idx).copied().unwrap_or(f32::NAN);
                    let ii = i.get(idx).copied().unwrap_or(f32::NAN);
                    100.0 * (qi * qi + ui * ui + vi * vi).sqrt() / ii
                }
                ComputedStokes::Plinear => (qi * qi + ui * ui).sqrt(),
                ComputedStokes::PFlinear => {
                    let ii = i.get(idx).copied().unwrap_or(f32::NAN);
                    100.0 * (qi * qi + ui * ui).sqrt() / ii
                }
                ComputedStokes::Pangle => {
                    0.5 * ui.atan2(qi) * 180.0 / std::f32::consts::PI
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ramp_frame as test_frame;
    use approx::assert_relative_eq;
    use cube_io::MemoryLoader;

    #[test]
    fn test_set_image_channels_validates() {
        let frame = test_frame(16, 16, 4, 2);
        assert!(frame.set_image_channels(1, 0).unwrap());
        assert!(!frame.set_image_channels(1, 0).unwrap());
        assert!(frame.set_image_channels(4, 0).is_err());
        assert!(frame.set_image_channels(0, 2).is_err());
        // failed request leaves state untouched
        assert_eq!(frame.current_z(), 1);
    }

    #[test]
    fn test_computed_stokes_accepted() {
        let frame = test_frame(8, 8, 2, 4);
        let pangle = ComputedStokes::Pangle.index();
        assert!(frame.set_image_channels(0, pangle).unwrap());
        assert_eq!(frame.current_stokes(), pangle);
        assert!(frame.image_cache_available());
    }

    #[test]
    fn test_channel_cache_invariant() {
        let frame = test_frame(8, 8, 3, 1);
        frame.fill_image_cache().unwrap();
        assert!(frame.image_cache_available());

        frame.set_image_channels(2, 0).unwrap();
        // set_image_channels reloads for channel-cached frames
        assert!(frame.image_cache_available());
        let value = frame.with_channel_cache(|c| c.get_value(0, 0));
        assert_relative_eq!(value, (2 * 64) as f32);
    }

    #[test]
    fn test_cursor_change_detection() {
        let frame = test_frame(8, 8, 1, 1);
        assert!(frame.set_cursor(1.0, 2.0));
        assert!(!frame.set_cursor(1.0, 2.0));
        assert!(frame.set_cursor(1.5, 2.0));
        assert!(frame.cursor().in_image(8, 8));
    }

    #[test]
    fn test_raster_identity_scenario() {
        // S1: 10x10, mip 1, full bounds, mean filter -> the image itself
        let frame = test_frame(10, 10, 1, 1);
        let bounds = ImageBounds::full(10, 10);
        let (data, w, h) = frame.get_raster_data(&bounds, 1, true).unwrap();
        assert_eq!((w, h), (10, 10));
        assert_eq!(data.len(), 100);
        for (i, v) in data.iter().enumerate() {
            assert_relative_eq!(*v, i as f32);
        }
    }

    #[test]
    fn test_raster_rejects_bad_requests() {
        let frame = test_frame(10, 10, 1, 1);
        let bounds = ImageBounds::full(10, 10);
        assert!(frame.get_raster_data(&bounds, 0, true).is_err());
        let too_big = ImageBounds::new(0, 11, 0, 10);
        assert!(frame.get_raster_data(&too_big, 1, true).is_err());
    }

    #[test]
    fn test_fill_raster_tile_raw() {
        let frame = test_frame(100, 100, 1, 1);
        let tile = Tile::new(0, 0, 0);
        let message = frame
            .fill_raster_tile_data(&tile, 0, 0, CompressionType::None, 0.0)
            .unwrap();
        assert_eq!(message.tiles.len(), 1);
        let tile_data = &message.tiles[0];
        assert_eq!(tile_data.width, 100);
        assert_eq!(tile_data.height, 100);
        match &tile_data.payload {
            TilePayload::Raw(values) => assert_eq!(values.len(), 100 * 100),
            _ => panic!("expected raw payload"),
        }
    }

    #[test]
    fn test_fill_raster_tile_cancelled_on_z_change() {
        let frame = test_frame(64, 64, 3, 1);
        let tile = Tile::new(0, 0, 0);
        let err = frame
            .fill_raster_tile_data(&tile, 2, 0, CompressionType::None, 0.0)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_compressed_tile_has_nan_mask() {
        let shape = ImageShape::plane(32, 32).unwrap();
        let mut data: Vec<f32> = (0..1024).map(|i| i as f32).collect();
        data[5] = f32::NAN;
        let loader =
            MemoryLoader::new("nan", shape, CoordinateSystem::pixel(), data).unwrap();
        let frame = Frame::new(0, Box::new(loader), "0").unwrap();

        let message = frame
            .fill_raster_tile_data(&Tile::new(0, 0, 0), 0, 0, CompressionType::Zfp, 16.0)
            .unwrap();
        match &message.tiles[0].payload {
            TilePayload::Compressed {
                data,
                nan_encodings,
            } => {
                assert!(!data.is_empty());
                assert_eq!(nan_encodings, &vec![5, 1, 1018]);
            }
            _ => panic!("expected compressed payload"),
        }
    }

    #[test]
    fn test_basic_stats_cached() {
        let frame = test_frame(8, 8, 2, 1);
        let a = frame.get_basic_stats(0, 0).unwrap();
        let b = frame.get_basic_stats(0, 0).unwrap();
        assert_eq!(a.num_pixels, 64);
        assert_relative_eq!(a.mean, b.mean);
    }

    #[test]
    fn test_histogram_s4_semantics() {
        // S4: [1, 2, NaN, Inf], 2 bins, auto bounds
        let shape = ImageShape::plane(2, 2).unwrap();
        let data = vec![1.0f32, 2.0, f32::NAN, f32::INFINITY];
        let loader =
            MemoryLoader::new("s4", shape, CoordinateSystem::pixel(), data).unwrap();
        let frame = Frame::new(0, Box::new(loader), "0").unwrap();

        let config = HistogramConfig {
            coordinate: "z".to_string(),
            channel: CURRENT_Z,
            num_bins: 2,
            bounds: None,
        };
        let histogram = frame.fill_histogram(&config).unwrap();
        assert_relative_eq!(histogram.bin_width, 0.5);
        assert_eq!(histogram.bins, vec![1, 1]);
    }

    #[test]
    fn test_image_histogram_stream() {
        let frame = test_frame(8, 8, 2, 1);
        frame.set_histogram_requirements(vec![HistogramConfig::auto("z", CURRENT_Z)]);

        let mut messages = Vec::new();
        assert!(frame
            .fill_region_histogram_data(|m| messages.push(m))
            .unwrap());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].region_id, cube_core::IMAGE_REGION_ID);
        assert_eq!(messages[0].channel, 0);
        assert_relative_eq!(messages[0].progress, 1.0);
        assert_eq!(messages[0].histogram.bins.iter().sum::<i64>(), 64);
    }

    #[test]
    fn test_loader_histogram_fast_path() {
        let shape = ImageShape::plane(8, 8).unwrap();
        let data: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let loader = MemoryLoader::new("stats", shape, CoordinateSystem::pixel(), data)
            .unwrap()
            .with_plane_stats(16);
        let frame = Frame::new(0, Box::new(loader), "0").unwrap();

        let config = HistogramConfig {
            coordinate: "z".to_string(),
            channel: CURRENT_Z,
            num_bins: 16,
            bounds: None,
        };
        let histogram = frame.fill_histogram(&config).unwrap();
        assert_eq!(histogram.num_bins, 16);
        assert_eq!(histogram.bins.iter().sum::<i64>(), 64);
    }

    #[test]
    fn test_stokes_coordinate_resolution() {
        let frame = test_frame(8, 8, 2, 4);
        assert_eq!(frame.get_stokes_type_index("z").unwrap(), 0);
        assert_eq!(frame.get_stokes_type_index("Qz").unwrap(), 1);
        assert_eq!(frame.get_stokes_type_index("Vx").unwrap(), 3);
        assert_eq!(
            frame.get_stokes_type_index("Ptotalz").unwrap(),
            ComputedStokes::Ptotal.index()
        );
        assert!(frame.get_stokes_type_index("bogus").is_err());
    }

    #[test]
    fn test_combine_plinear() {
        let mut components = HashMap::new();
        components.insert(StokesType::Q, vec![3.0f32, f32::NAN]);
        components.insert(StokesType::U, vec![4.0f32, 1.0]);
        let result = combine_computed_stokes(ComputedStokes::Plinear, &components);
        assert_relative_eq!(result[0], 5.0);
        assert!(result[1].is_nan());
    }

    #[test]
    fn test_combine_pangle_degrees() {
        let mut components = HashMap::new();
        components.insert(StokesType::Q, vec![1.0f32]);
        components.insert(StokesType::U, vec![1.0f32]);
        let result = combine_computed_stokes(ComputedStokes::Pangle, &components);
        assert_relative_eq!(result[0], 22.5, epsilon = 1e-4);
    }

    #[test]
    fn test_region_stats_with_mask() {
        let frame = test_frame(8, 8, 2, 1);
        let region = StokesRegion {
            mask: cube_region::RegionMask {
                origin: (2, 2),
                width: 2,
                height: 2,
                mask: vec![true, true, true, false],
            },
            z_from: 0,
            z_to: 1,
            stokes: 0,
        };
        let stats = frame
            .get_region_stats(&region, &[StatsType::NumPixels, StatsType::Mean], true)
            .unwrap();
        assert_eq!(stats[&StatsType::NumPixels], vec![3.0, 3.0]);
        // plane 0 pixels (2,2)=18 (3,2)=19 (2,3)=26
        assert_relative_eq!(stats[&StatsType::Mean][0], 21.0);
    }

    #[test]
    fn test_wait_for_task_cancellation_disconnects() {
        let frame = test_frame(4, 4, 1, 1);
        assert!(frame.is_connected());
        frame.wait_for_task_cancellation();
        assert!(!frame.is_connected());
        assert!(frame.set_image_channels(0, 0).is_err());
    }
}
