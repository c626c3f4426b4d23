//! FITS format support.
//!
//! Hand-rolled reader and writer for the primary HDU of single-image FITS
//! files: 2880-byte header blocks of 80-character cards, big-endian data
//! in the BITPIX types {8, 16, 32, -32, -64} with BSCALE/BZERO scaling and
//! BLANK for integer blanking.
//!
//! The reader is seek-based: slices read only the bytes they cover, so
//! cursor spectra and small tiles never page the whole cube through
//! memory.

use crate::error::{IoError, IoResult};
use crate::traits::FileLoader;
use byteorder::{BigEndian, ByteOrder};
use cube_core::{
    AxisDescriptor, CoordinateSystem, ImageShape, Slicer, StokesSource, StokesType,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// FITS header/data block size in bytes.
const FITS_BLOCK: usize = 2880;

/// Header card length in bytes.
const CARD: usize = 80;

/// Spectral axis CTYPE prefixes.
const SPECTRAL_TYPES: [&str; 8] = [
    "FREQ", "VELO", "VRAD", "VOPT", "FELO", "WAVE", "AWAV", "ENER",
];

#[derive(Debug, Clone)]
struct FitsHeader {
    bitpix: i32,
    dims: Vec<usize>,
    bscale: f64,
    bzero: f64,
    blank: Option<i64>,
    spectral_axis: i32,
    stokes_axis: i32,
    axes: Vec<AxisDescriptor>,
    beam_area: Option<f64>,
    data_start: u64,
}

impl FitsHeader {
    fn bytes_per_pixel(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }
}

fn card_value(card: &str) -> Option<&str> {
    let (_, rest) = card.split_at(card.find('=')? + 1);
    let value = match rest.find('/') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    Some(value.trim())
}

fn string_value(card: &str) -> Option<String> {
    let value = card_value(card)?;
    let value = value.trim_matches('\'').trim();
    Some(value.to_string())
}

fn float_value(card: &str) -> Option<f64> {
    card_value(card)?.parse().ok()
}

fn int_value(card: &str) -> Option<i64> {
    card_value(card)?.parse().ok()
}

fn parse_header<R: Read + Seek>(reader: &mut R, path: &str) -> IoResult<FitsHeader> {
    let mut block = [0u8; FITS_BLOCK];
    reader.read_exact(&mut block)?;
    if &block[..9] != b"SIMPLE  =" {
        return Err(IoError::parse(format!("{path}: not a FITS primary HDU")));
    }

    let mut bitpix = 0i32;
    let mut naxis = 0usize;
    let mut dims: Vec<usize> = Vec::new();
    let mut bscale = 1.0f64;
    let mut bzero = 0.0f64;
    let mut blank: Option<i64> = None;
    let mut ctypes: Vec<String> = Vec::new();
    let mut crpix: Vec<f64> = Vec::new();
    let mut crval: Vec<f64> = Vec::new();
    let mut cdelt: Vec<f64> = Vec::new();
    let mut cunit: Vec<String> = Vec::new();
    let mut bmaj: Option<f64> = None;
    let mut bmin: Option<f64> = None;
    let mut blocks_read = 1u64;
    let mut ended = false;

    'blocks: loop {
        for card_idx in 0..(FITS_BLOCK / CARD) {
            let card = String::from_utf8_lossy(
                &block[card_idx * CARD..(card_idx + 1) * CARD],
            )
            .to_string();
            // header cards are ASCII; a lossy replacement may shift byte
            // boundaries, so slice defensively
            let key = card.get(..8).unwrap_or("").trim_end().to_string();

            match key.as_str() {
                "END" => {
                    ended = true;
                    break 'blocks;
                }
                "BITPIX" => {
                    bitpix = int_value(&card)
                        .ok_or_else(|| IoError::parse("bad BITPIX"))?
                        as i32
                }
                "NAXIS" => {
                    naxis = int_value(&card).ok_or_else(|| IoError::parse("bad NAXIS"))?
                        as usize;
                    dims.resize(naxis, 1);
                    ctypes.resize(naxis, String::new());
                    crpix.resize(naxis, 1.0);
                    crval.resize(naxis, 0.0);
                    cdelt.resize(naxis, 1.0);
                    cunit.resize(naxis, String::new());
                }
                "BSCALE" => bscale = float_value(&card).unwrap_or(1.0),
                "BZERO" => bzero = float_value(&card).unwrap_or(0.0),
                "BLANK" => blank = int_value(&card),
                "BMAJ" => bmaj = float_value(&card),
                "BMIN" => bmin = float_value(&card),
                _ => {
                    if let Some(n) = indexed_key(&key, "NAXIS") {
                        if n <= naxis {
                            dims[n - 1] = int_value(&card).unwrap_or(1).max(1) as usize;
                        }
                    } else if let Some(n) = indexed_key(&key, "CTYPE") {
                        if n <= naxis {
                            ctypes[n - 1] = string_value(&card).unwrap_or_default();
                        }
                    } else if let Some(n) = indexed_key(&key, "CRPIX") {
                        if n <= naxis {
                            crpix[n - 1] = float_value(&card).unwrap_or(1.0);
                        }
                    } else if let Some(n) = indexed_key(&key, "CRVAL") {
                        if n <= naxis {
                            crval[n - 1] = float_value(&card).unwrap_or(0.0);
                        }
                    } else if let Some(n) = indexed_key(&key, "CDELT") {
                        if n <= naxis {
                            cdelt[n - 1] = float_value(&card).unwrap_or(1.0);
                        }
                    } else if let Some(n) = indexed_key(&key, "CUNIT") {
                        if n <= naxis {
                            cunit[n - 1] = string_value(&card).unwrap_or_default();
                        }
                    }
                }
            }
        }
        reader.read_exact(&mut block)?;
        blocks_read += 1;
    }

    if !ended {
        return Err(IoError::parse(format!("{path}: header without END card")));
    }
    if dims.is_empty() {
        return Err(IoError::parse(format!("{path}: image has no axes")));
    }

    let mut spectral_axis = -1i32;
    let mut stokes_axis = -1i32;
    for (i, ctype) in ctypes.iter().enumerate() {
        let upper = ctype.to_uppercase();
        if SPECTRAL_TYPES.iter().any(|t| upper.starts_with(t)) {
            spectral_axis = i as i32;
        } else if upper.starts_with("STOKES") {
            stokes_axis = i as i32;
        }
    }

    let axes = (0..dims.len())
        .map(|i| AxisDescriptor {
            ctype: ctypes[i].clone(),
            cunit: cunit[i].clone(),
            // FITS CRPIX is one-based
            crpix: crpix[i] - 1.0,
            crval: crval[i],
            cdelt: cdelt[i],
        })
        .collect();

    // beam in the same angular units as the spatial increments
    let beam_area = match (bmaj, bmin) {
        (Some(maj), Some(min)) if cdelt.len() >= 2 && cdelt[0] != 0.0 && cdelt[1] != 0.0 => {
            let pixel_area = (cdelt[0] * cdelt[1]).abs();
            Some(std::f64::consts::PI / (4.0 * std::f64::consts::LN_2) * maj * min
                / pixel_area)
        }
        _ => None,
    };

    Ok(FitsHeader {
        bitpix,
        dims,
        bscale,
        bzero,
        blank,
        spectral_axis,
        stokes_axis,
        axes,
        beam_area,
        data_start: blocks_read * FITS_BLOCK as u64,
    })
}

fn indexed_key(key: &str, prefix: &str) -> Option<usize> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Seek-based loader for the primary HDU of a FITS file.
pub struct FitsLoader {
    path: PathBuf,
    name: String,
    hdu: String,
    header: Option<FitsHeader>,
    shape: Option<ImageShape>,
    reader: Option<BufReader<File>>,
    mtime: Option<SystemTime>,
}

impl FitsLoader {
    /// Creates a loader for `path`; nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            name,
            hdu: "0".to_string(),
            header: None,
            shape: None,
            reader: None,
            mtime: None,
        }
    }

    fn header(&self) -> IoResult<&FitsHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| IoError::file_access(self.path.display().to_string(), "not open"))
    }

    /// File-order pixel strides.
    fn strides(dims: &[usize]) -> Vec<u64> {
        let mut strides = vec![1u64; dims.len()];
        for i in 1..dims.len() {
            strides[i] = strides[i - 1] * dims[i - 1] as u64;
        }
        strides
    }

    fn convert_run(header: &FitsHeader, raw: &[u8], out: &mut [f32]) {
        let (bscale, bzero) = (header.bscale, header.bzero);
        match header.bitpix {
            -32 => {
                for (i, dst) in out.iter_mut().enumerate() {
                    let v = BigEndian::read_f32(&raw[i * 4..]);
                    *dst = (bzero + bscale * v as f64) as f32;
                }
            }
            -64 => {
                for (i, dst) in out.iter_mut().enumerate() {
                    let v = BigEndian::read_f64(&raw[i * 8..]);
                    *dst = (bzero + bscale * v) as f32;
                }
            }
            8 => {
                for (i, dst) in out.iter_mut().enumerate() {
                    let v = raw[i] as i64;
                    *dst = blank_or(header, v);
                }
            }
            16 => {
                for (i, dst) in out.iter_mut().enumerate() {
                    let v = BigEndian::read_i16(&raw[i * 2..]) as i64;
                    *dst = blank_or(header, v);
                }
            }
            32 => {
                for (i, dst) in out.iter_mut().enumerate() {
                    let v = BigEndian::read_i32(&raw[i * 4..]) as i64;
                    *dst = blank_or(header, v);
                }
            }
            _ => out.fill(f32::NAN),
        }
    }
}

#[inline]
fn blank_or(header: &FitsHeader, raw: i64) -> f32 {
    if header.blank == Some(raw) {
        f32::NAN
    } else {
        (header.bzero + header.bscale * raw as f64) as f32
    }
}

impl FileLoader for FitsLoader {
    fn open_file(&mut self, hdu: &str) -> IoResult<()> {
        if !hdu.is_empty() && hdu != "0" {
            return Err(IoError::not_supported(format!(
                "FITS extension HDU {hdu}"
            )));
        }
        if self.header.is_some() && self.reader.is_some() {
            return Ok(()); // idempotent
        }

        let file = File::open(&self.path).map_err(|e| {
            IoError::file_access(self.path.display().to_string(), e.to_string())
        })?;
        self.mtime = file.metadata().ok().and_then(|m| m.modified().ok());
        let mut reader = BufReader::new(file);
        let header = parse_header(&mut reader, &self.path.display().to_string())?;

        let shape = ImageShape::new(
            header.dims.clone(),
            header.spectral_axis,
            header.stokes_axis,
        )
        .map_err(|e| IoError::parse(e.to_string()))?;

        tracing::debug!(
            "opened {} ({:?}, bitpix {})",
            self.name,
            header.dims,
            header.bitpix
        );

        self.hdu = "0".to_string();
        self.header = Some(header);
        self.shape = Some(shape);
        self.reader = Some(reader);
        Ok(())
    }

    fn file_name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> &ImageShape {
        self.shape.as_ref().expect("loader opened")
    }

    fn coordinate_system(&self, _source: &StokesSource) -> CoordinateSystem {
        match self.header() {
            Ok(header) => CoordinateSystem {
                x: header.axes[0].clone(),
                y: header.axes[1].clone(),
                spectral: (header.spectral_axis >= 0)
                    .then(|| header.axes[header.spectral_axis as usize].clone()),
                radesys: String::new(),
            },
            Err(_) => CoordinateSystem::pixel(),
        }
    }

    fn stokes_type_at(&self, index: usize) -> Option<StokesType> {
        let header = self.header.as_ref()?;
        if header.stokes_axis < 0 {
            return (index == 0).then_some(StokesType::I);
        }
        let axis = &header.axes[header.stokes_axis as usize];
        let value = axis.crval + (index as f64 - axis.crpix) * axis.cdelt;
        StokesType::from_fits_value(value.round() as i32)
    }

    fn beam_area(&self) -> Option<f64> {
        self.header.as_ref()?.beam_area
    }

    fn get_slice(&mut self, buf: &mut [f32], slicer: &Slicer) -> IoResult<()> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| IoError::file_access(self.name.clone(), "not open"))?;
        let shape = self
            .shape
            .clone()
            .ok_or_else(|| IoError::file_access(self.name.clone(), "not open"))?;
        slicer
            .check(&shape)
            .map_err(|e| IoError::InvalidRegion(e.to_string()))?;
        if buf.len() != slicer.length() {
            return Err(IoError::InvalidRegion(format!(
                "buffer length {} != slicer length {}",
                buf.len(),
                slicer.length()
            )));
        }

        let strides = Self::strides(&header.dims);
        let stride_x = strides[0];
        let stride_y = strides[1];
        let stride_z = shape
            .spectral_axis()
            .map(|ax| strides[ax])
            .unwrap_or(0);
        let stride_s = shape.stokes_axis().map(|ax| strides[ax]).unwrap_or(0);

        let bpp = header.bytes_per_pixel();
        let [x0, y0, z0, s0] = slicer.start;
        let [nx, ny, nz, ns] = slicer.count;

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| IoError::file_access(self.name.clone(), "not open"))?;
        let mut raw = vec![0u8; nx * bpp];

        for s in 0..ns {
            for z in 0..nz {
                for y in 0..ny {
                    let pixel_offset = x0 as u64 * stride_x
                        + (y0 + y) as u64 * stride_y
                        + (z0 + z) as u64 * stride_z
                        + (s0 + s) as u64 * stride_s;
                    reader.seek(SeekFrom::Start(
                        header.data_start + pixel_offset * bpp as u64,
                    ))?;
                    reader.read_exact(&mut raw)?;

                    let out_base = ((s * nz + z) * ny + y) * nx;
                    Self::convert_run(&header, &raw, &mut buf[out_base..out_base + nx]);
                }
            }
        }
        Ok(())
    }

    fn close_image_if_updated(&mut self) -> IoResult<bool> {
        let current = std::fs::metadata(&self.path)
            .ok()
            .and_then(|m| m.modified().ok());
        if current != self.mtime {
            self.header = None;
            self.reader = None;
            self.open_file("0")?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Writes a 2-d/3-d float image as a FITS primary HDU.
pub fn write_fits(
    path: impl AsRef<Path>,
    shape: &ImageShape,
    csys: &CoordinateSystem,
    data: &[f32],
) -> IoResult<()> {
    if data.len() != shape.total_size() {
        return Err(IoError::InvalidRegion(format!(
            "data length {} != shape size {}",
            data.len(),
            shape.total_size()
        )));
    }

    let file = File::create(path.as_ref()).map_err(|e| {
        IoError::file_access(path.as_ref().display().to_string(), e.to_string())
    })?;
    let mut writer = BufWriter::new(file);

    let mut cards: Vec<String> = Vec::new();
    cards.push(format!("{:<8}= {:>20}", "SIMPLE", "T"));
    cards.push(format!("{:<8}= {:>20}", "BITPIX", -32));
    cards.push(format!("{:<8}= {:>20}", "NAXIS", shape.ndim()));
    for (i, dim) in shape.dims().iter().enumerate() {
        cards.push(format!("{:<8}= {:>20}", format!("NAXIS{}", i + 1), dim));
    }

    let mut axis_cards = |idx: usize, desc: &AxisDescriptor| {
        cards.push(format!("{:<8}= '{}'", format!("CTYPE{idx}"), desc.ctype));
        cards.push(format!("{:<8}= {:>20.10E}", format!("CRPIX{idx}"), desc.crpix + 1.0));
        cards.push(format!("{:<8}= {:>20.10E}", format!("CRVAL{idx}"), desc.crval));
        cards.push(format!("{:<8}= {:>20.10E}", format!("CDELT{idx}"), desc.cdelt));
        if !desc.cunit.is_empty() {
            cards.push(format!("{:<8}= '{}'", format!("CUNIT{idx}"), desc.cunit));
        }
    };
    axis_cards(1, &csys.x);
    axis_cards(2, &csys.y);
    if let (Some(ax), Some(desc)) = (shape.spectral_axis(), csys.spectral.as_ref()) {
        axis_cards(ax + 1, desc);
    }
    cards.push("END".to_string());

    let mut header_bytes = Vec::with_capacity(FITS_BLOCK);
    for card in &cards {
        let mut bytes = card.clone().into_bytes();
        bytes.resize(CARD, b' ');
        header_bytes.extend_from_slice(&bytes);
    }
    while header_bytes.len() % FITS_BLOCK != 0 {
        header_bytes.push(b' ');
    }
    writer.write_all(&header_bytes)?;

    let mut data_bytes = vec![0u8; data.len() * 4];
    for (i, &v) in data.iter().enumerate() {
        BigEndian::write_f32(&mut data_bytes[i * 4..], v);
    }
    while data_bytes.len() % FITS_BLOCK != 0 {
        data_bytes.push(0);
    }
    writer.write_all(&data_bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cube_core::AxisRange;

    fn radio_csys(depth: bool) -> CoordinateSystem {
        CoordinateSystem {
            x: AxisDescriptor {
                ctype: "RA---SIN".into(),
                cunit: "deg".into(),
                crpix: 5.0,
                crval: 120.0,
                cdelt: -2.0 / 3600.0,
            },
            y: AxisDescriptor {
                ctype: "DEC--SIN".into(),
                cunit: "deg".into(),
                crpix: 5.0,
                crval: -45.0,
                cdelt: 2.0 / 3600.0,
            },
            spectral: depth.then(|| AxisDescriptor {
                ctype: "FREQ".into(),
                cunit: "Hz".into(),
                crpix: 0.0,
                crval: 1.4e9,
                cdelt: 1e6,
            }),
            radesys: String::new(),
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.fits");

        let shape = ImageShape::cube(10, 8, 5).unwrap();
        let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32 * 0.5).collect();
        write_fits(&path, &shape, &radio_csys(true), &data).unwrap();

        let mut loader = FitsLoader::new(&path);
        loader.open_file("0").unwrap();
        assert_eq!(loader.shape().width(), 10);
        assert_eq!(loader.shape().height(), 8);
        assert_eq!(loader.shape().depth(), 5);

        // whole plane of channel 2
        let slicer = Slicer::plane(loader.shape(), 2, 0);
        let mut buf = vec![0.0f32; slicer.length()];
        loader.get_slice(&mut buf, &slicer).unwrap();
        for (i, &v) in buf.iter().enumerate() {
            assert_relative_eq!(v, (2 * 80 + i) as f32 * 0.5);
        }
    }

    #[test]
    fn test_spectrum_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.fits");
        let shape = ImageShape::cube(4, 4, 6).unwrap();
        let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
        write_fits(&path, &shape, &radio_csys(true), &data).unwrap();

        let mut loader = FitsLoader::new(&path);
        loader.open_file("0").unwrap();
        let slicer = Slicer::spectrum(1, 2, 0, 5, 0);
        let mut buf = vec![0.0f32; 6];
        loader.get_slice(&mut buf, &slicer).unwrap();
        for (z, &v) in buf.iter().enumerate() {
            assert_relative_eq!(v, (z * 16 + 2 * 4 + 1) as f32);
        }
    }

    #[test]
    fn test_coordinate_system_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plane.fits");
        let shape = ImageShape::plane(6, 6).unwrap();
        write_fits(&path, &shape, &radio_csys(false), &vec![0.0; 36]).unwrap();

        let mut loader = FitsLoader::new(&path);
        loader.open_file("0").unwrap();
        let csys = loader.coordinate_system(&StokesSource::Original);
        assert_relative_eq!(csys.cdelt2_arcsec(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(csys.x.crpix, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let mut loader = FitsLoader::new("/nonexistent/image.fits");
        assert!(loader.open_file("0").is_err());
    }

    #[test]
    fn test_extension_hdu_not_supported() {
        let mut loader = FitsLoader::new("/tmp/whatever.fits");
        let err = loader.open_file("3").unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_close_if_updated_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.fits");
        let shape = ImageShape::plane(4, 4).unwrap();
        write_fits(&path, &shape, &radio_csys(false), &vec![1.0; 16]).unwrap();

        let mut loader = FitsLoader::new(&path);
        loader.open_file("0").unwrap();
        assert!(!loader.close_image_if_updated().unwrap());

        // touch the file with a different mtime
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();
        drop(file);
        assert!(loader.close_image_if_updated().unwrap());
    }

    #[test]
    fn test_stokes_source_is_ignored_for_csys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.fits");
        let shape = ImageShape::plane(4, 4).unwrap();
        write_fits(&path, &shape, &radio_csys(false), &vec![0.0; 16]).unwrap();
        let mut loader = FitsLoader::new(&path);
        loader.open_file("0").unwrap();

        let original = loader.coordinate_system(&StokesSource::Original);
        let computed = loader.coordinate_system(&StokesSource::Computed {
            stokes: cube_core::ComputedStokes::Plinear.index(),
            z_range: AxisRange::all(),
        });
        assert_eq!(original, computed);
    }
}
