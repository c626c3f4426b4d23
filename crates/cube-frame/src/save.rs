//! Saving sub-cubes to disk.
//!
//! Writes the requested channel range of one Stokes plane as a FITS
//! primary HDU. The source image itself is never modified; generated
//! images (moments, PV) go through the same writer via their in-memory
//! loaders.

use crate::frame::Frame;
use cube_core::messages::SaveFileAck;
use cube_core::requests::{SaveFileFormat, SaveFileRequest};
use cube_core::{CoordinateSystem, ImageShape, Result, Slicer};
use cube_io::write_fits;
use std::path::Path;

impl Frame {
    /// Writes a channel range of one Stokes plane to `root_folder`.
    pub fn save_file(&self, root_folder: &Path, request: &SaveFileRequest) -> SaveFileAck {
        match self.save_file_inner(root_folder, request) {
            Ok(()) => SaveFileAck {
                success: true,
                message: String::new(),
            },
            Err(err) => SaveFileAck {
                success: false,
                message: err.to_string(),
            },
        }
    }

    fn save_file_inner(&self, root_folder: &Path, request: &SaveFileRequest) -> Result<()> {
        let SaveFileFormat::Fits = request.output_format;
        let stokes = self.check_stokes(request.stokes)?;
        let (z_from, z_to) = request
            .channels
            .resolve(self.depth(), self.current_z())?;
        let num_z = z_to - z_from + 1;

        let slicer = Slicer::new(
            [0, 0, z_from, 0],
            [self.width(), self.height(), num_z, 1],
        );
        let data = self.get_slice_data(&slicer, stokes)?;

        let source = self.coordinate_system();
        let (shape, csys) = if num_z > 1 {
            (
                ImageShape::cube(self.width(), self.height(), num_z)?,
                CoordinateSystem {
                    x: source.x.clone(),
                    y: source.y.clone(),
                    spectral: source.spectral.as_ref().map(|desc| {
                        let mut desc = desc.clone();
                        // re-reference the spectral axis to the kept range
                        desc.crpix -= z_from as f64;
                        desc
                    }),
                    radesys: source.radesys.clone(),
                },
            )
        } else {
            (
                ImageShape::plane(self.width(), self.height())?,
                CoordinateSystem {
                    x: source.x.clone(),
                    y: source.y.clone(),
                    spectral: None,
                    radesys: source.radesys.clone(),
                },
            )
        };

        let output = root_folder.join(&request.output_file_name);
        write_fits(&output, &shape, &csys, &data).map_err(cube_core::Error::from)?;
        tracing::debug!(
            "saved {} channels of stokes {} to {}",
            num_z,
            stokes,
            output.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ramp_frame;
    use approx::assert_relative_eq;
    use cube_core::AxisRange;
    use cube_io::{FileLoader, FitsLoader};

    fn request(name: &str, channels: AxisRange) -> SaveFileRequest {
        SaveFileRequest {
            file_id: 0,
            output_file_name: name.to_string(),
            output_format: SaveFileFormat::Fits,
            channels,
            stokes: 0,
        }
    }

    #[test]
    fn test_save_channel_range_round_trips() {
        let frame = ramp_frame(6, 4, 8, 1);
        let dir = tempfile::tempdir().unwrap();

        let ack = frame.save_file(dir.path(), &request("sub.fits", AxisRange::new(2, 4)));
        assert!(ack.success, "{}", ack.message);

        let mut loader = FitsLoader::new(dir.path().join("sub.fits"));
        loader.open_file("0").unwrap();
        assert_eq!(loader.shape().depth(), 3);

        let slicer = Slicer::plane(&loader.shape().clone(), 0, 0);
        let mut buf = vec![0.0f32; slicer.length()];
        loader.get_slice(&mut buf, &slicer).unwrap();
        // channel 2 of the ramp starts at 2 * 24
        assert_relative_eq!(buf[0], 48.0);
    }

    #[test]
    fn test_save_single_plane() {
        let frame = ramp_frame(5, 5, 3, 1);
        let dir = tempfile::tempdir().unwrap();
        let ack = frame.save_file(dir.path(), &request("plane.fits", AxisRange::single(1)));
        assert!(ack.success);

        let mut loader = FitsLoader::new(dir.path().join("plane.fits"));
        loader.open_file("0").unwrap();
        assert_eq!(loader.shape().ndim(), 2);
    }

    #[test]
    fn test_save_rejects_bad_range() {
        let frame = ramp_frame(4, 4, 2, 1);
        let dir = tempfile::tempdir().unwrap();
        let ack = frame.save_file(dir.path(), &request("bad.fits", AxisRange::new(1, 9)));
        assert!(!ack.success);
        assert!(!ack.message.is_empty());
    }
}
