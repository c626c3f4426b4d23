//! Position-velocity images and line spatial profiles.
//!
//! Both products ride on the line engine: a line (or polyline) with an
//! averaging width becomes box means per offset, per channel for a PV
//! image or at the current channel for a line spatial profile. The PV
//! generator turns the `[num_boxes × depth]` matrix into an in-memory
//! image whose x axis is angular offset (auto-scaled unit) and whose y
//! axis is the source's spectral axis; a *reverse* PV swaps the two.

use crate::handler::RegionHandler;
use crate::line_profiles::{adjust_increment_unit, LineProfileContext, LineProfiles};
use cube_core::messages::{
    GeneratedImage, PvResponse, SpatialProfile, SpatialProfileData,
};
use cube_core::requests::PvRequest;
use cube_core::{AxisDescriptor, CoordinateSystem, Error, ImageShape, Result};
use cube_frame::Frame;
use cube_io::MemoryLoader;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Synthetic file id block of PV products.
pub const PV_ID_MULTIPLIER: i32 = 10_000;

impl RegionHandler {
    /// Generates a PV image along a line region.
    ///
    /// Progress is reported through `progress` at a bounded cadence; a
    /// stop via [`RegionHandler::stop_pv`] yields a cancelled response.
    pub fn calculate_pv_image(
        &self,
        request: &PvRequest,
        progress: impl FnMut(f64),
    ) -> PvResponse {
        match self.calculate_pv_inner(request, progress) {
            Ok(image) => PvResponse {
                success: true,
                cancelled: false,
                message: String::new(),
                image: Some(image),
            },
            Err(err) if err.is_cancelled() => PvResponse {
                success: false,
                cancelled: true,
                message: err.to_string(),
                image: None,
            },
            Err(err) => PvResponse {
                success: false,
                cancelled: false,
                message: err.to_string(),
                image: None,
            },
        }
    }

    fn calculate_pv_inner(
        &self,
        request: &PvRequest,
        mut progress: impl FnMut(f64),
    ) -> Result<GeneratedImage> {
        let frame = self
            .frame(request.file_id)
            .ok_or_else(|| Error::invalid_request("file is not open"))?;
        let region = self
            .region(request.region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        let state = region.state();
        if !state.region_type.is_line_type() {
            return Err(Error::invalid_request("PV needs a line or polyline region"));
        }
        if frame.shape().spectral_axis().is_none() {
            return Err(Error::invalid_request("image has no spectral axis"));
        }
        self.pv_stop_flag(request.file_id).store(false, Ordering::Release);
        let _task = frame.active_task_lock().read().expect("task lock");
        let _region_task = region.active_task_lock().read().expect("task lock");
        let start = std::time::Instant::now();

        let context = LineProfileContext {
            handler: self,
            frame: &frame,
            file_id: request.file_id,
            region_id: request.region_id,
            region_state: state,
            width: request.width.max(1),
            per_z: true,
            stokes: frame.current_stokes(),
            coordinate: "z".to_string(),
        };
        let profiles = self.get_line_profiles(&context, &mut progress)?;
        tracing::debug!(
            "PV matrix {}x{} (max pixels {}) in {:.3} ms",
            profiles.rows.len(),
            frame.depth(),
            profiles.max_num_pixels,
            start.elapsed().as_secs_f64() * 1e3
        );

        let (z_from, z_to) = request
            .spectral_range
            .resolve(frame.depth(), frame.current_z())?;
        self.build_pv_image(&frame, request, &profiles, z_from, z_to)
    }

    /// Assembles the generated image from the profile matrix.
    fn build_pv_image(
        &self,
        frame: &Arc<Frame>,
        request: &PvRequest,
        profiles: &LineProfiles,
        z_from: usize,
        z_to: usize,
    ) -> Result<GeneratedImage> {
        let num_boxes = profiles.rows.len();
        let num_z = z_to - z_from + 1;
        let (increment, unit) = adjust_increment_unit(profiles.increment_arcsec, num_boxes);

        let offset_axis = AxisDescriptor {
            ctype: "OFFSET".to_string(),
            cunit: unit,
            crpix: (num_boxes as f64 - 1.0) / 2.0,
            crval: 0.0,
            cdelt: increment,
        };
        let source = frame.coordinate_system();
        let spectral_axis = source
            .spectral
            .clone()
            .map(|mut desc| {
                desc.crpix -= z_from as f64;
                desc
            })
            .unwrap_or_else(|| AxisDescriptor::linear("CHANNEL"));

        let (shape, csys, data) = if request.reverse {
            // spectral axis horizontal, offset vertical
            let mut data = vec![0.0f32; num_z * num_boxes];
            for (b, row) in profiles.rows.iter().enumerate() {
                for z in z_from..=z_to {
                    data[b * num_z + (z - z_from)] = row[z] as f32;
                }
            }
            (
                ImageShape::plane(num_z, num_boxes)?,
                CoordinateSystem {
                    x: spectral_axis,
                    y: offset_axis,
                    spectral: None,
                    radesys: source.radesys.clone(),
                },
                data,
            )
        } else {
            let mut data = vec![0.0f32; num_boxes * num_z];
            for (b, row) in profiles.rows.iter().enumerate() {
                for z in z_from..=z_to {
                    data[(z - z_from) * num_boxes + b] = row[z] as f32;
                }
            }
            (
                ImageShape::plane(num_boxes, num_z)?,
                CoordinateSystem {
                    x: offset_axis,
                    y: spectral_axis,
                    spectral: None,
                    radesys: source.radesys.clone(),
                },
                data,
            )
        };

        Ok(GeneratedImage {
            file_id: (request.file_id + 1) * PV_ID_MULTIPLIER,
            name: format!(
                "{}.pv",
                frame.with_loader(|loader| loader.file_name().to_string())
            ),
            shape,
            csys,
            data,
        })
    }

    /// Generates a quick-look PV image from a spatially block-averaged
    /// preview cube.
    pub fn calculate_pv_preview(
        &self,
        request: &PvRequest,
        rebin_xy: usize,
        progress: impl FnMut(f64),
    ) -> PvResponse {
        match self.calculate_pv_preview_inner(request, rebin_xy.max(1), progress) {
            Ok(image) => PvResponse {
                success: true,
                cancelled: false,
                message: String::new(),
                image: Some(image),
            },
            Err(err) if err.is_cancelled() => PvResponse {
                success: false,
                cancelled: true,
                message: err.to_string(),
                image: None,
            },
            Err(err) => PvResponse {
                success: false,
                cancelled: false,
                message: err.to_string(),
                image: None,
            },
        }
    }

    fn calculate_pv_preview_inner(
        &self,
        request: &PvRequest,
        rebin_xy: usize,
        mut progress: impl FnMut(f64),
    ) -> Result<GeneratedImage> {
        let frame = self
            .frame(request.file_id)
            .ok_or_else(|| Error::invalid_request("file is not open"))?;
        let region = self
            .region(request.region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        let state = region.state();
        if !state.region_type.is_line_type() {
            return Err(Error::invalid_request("PV needs a line or polyline region"));
        }
        self.pv_stop_flag(request.file_id).store(false, Ordering::Release);

        // block-average the cube spatially into an ephemeral preview frame
        let width = frame.width().div_ceil(rebin_xy);
        let height = frame.height().div_ceil(rebin_xy);
        let depth = frame.depth();
        let mut data = Vec::with_capacity(width * height * depth);
        for z in 0..depth {
            let plane = frame.get_z_matrix(z, frame.current_stokes())?;
            let mut down = vec![0.0f32; width * height];
            cube_kernels::block_smooth(
                &plane,
                &mut down,
                frame.width(),
                frame.height(),
                width,
                height,
                0,
                0,
                rebin_xy,
            );
            data.extend_from_slice(&down);
        }

        let mut csys = frame.coordinate_system().clone();
        csys.x.cdelt *= rebin_xy as f64;
        csys.x.crpix /= rebin_xy as f64;
        csys.y.cdelt *= rebin_xy as f64;
        csys.y.crpix /= rebin_xy as f64;
        let shape = if depth > 1 {
            ImageShape::cube(width, height, depth)?
        } else {
            ImageShape::plane(width, height)?
        };
        let loader = MemoryLoader::new("pv.preview.cube", shape, csys, data)
            .map_err(Error::from)?;
        let preview_frame = Arc::new(Frame::new(request.file_id, Box::new(loader), "0")?);

        // scale the line into preview pixels
        let mut preview_state = state.clone();
        for point in &mut preview_state.control_points {
            *point /= rebin_xy as f64;
        }

        let context = LineProfileContext {
            handler: self,
            frame: &preview_frame,
            file_id: request.file_id,
            region_id: request.region_id,
            region_state: preview_state,
            width: (request.width.max(1)).div_ceil(rebin_xy),
            per_z: true,
            stokes: 0,
            coordinate: "z".to_string(),
        };
        let profiles = self.get_line_profiles(&context, &mut progress)?;
        let (z_from, z_to) = request
            .spectral_range
            .resolve(preview_frame.depth(), preview_frame.current_z())?;
        let mut image =
            self.build_pv_image(&preview_frame, request, &profiles, z_from, z_to)?;
        image.file_id += 1; // previews live next to the full product
        image.name.push_str(".preview");
        Ok(image)
    }

    /// Streams line spatial profiles for every spatial requirement of a
    /// line (or point) region on a file.
    pub fn fill_line_spatial_profile_data(
        &self,
        region_id: i32,
        file_id: i32,
        mut callback: impl FnMut(SpatialProfileData),
    ) -> Result<bool> {
        let configs = self.spatial_configs(region_id, file_id);
        if configs.is_empty() {
            return Ok(false);
        }
        let Some(frame) = self.frame(file_id) else {
            return Ok(false);
        };
        let Some(region) = self.region(region_id) else {
            return Ok(false);
        };
        let state = region.state();

        // point regions reuse the cursor machinery at the point
        if state.region_type == cube_region::RegionType::Point {
            let point = cube_frame::PointXy::new(
                state.control_points[0].x,
                state.control_points[0].y,
            );
            if let Some(data) =
                frame.fill_spatial_profile_data_at(point, &configs, region_id)?
            {
                callback(data);
            }
            return Ok(true);
        }
        if !state.region_type.is_line_type() {
            return Err(Error::invalid_request(
                "line spatial profiles need a line region",
            ));
        }

        let center = state
            .control_points
            .iter()
            .fold(glam::DVec2::ZERO, |acc, p| acc + *p)
            / state.control_points.len() as f64;

        for config in configs {
            let context = LineProfileContext {
                handler: self,
                frame: &frame,
                file_id,
                region_id,
                region_state: state.clone(),
                width: config.width.max(1),
                per_z: false,
                stokes: frame.get_stokes_type_index(&config.coordinate)?,
                coordinate: config.coordinate.clone(),
            };
            let profiles = match self.get_line_profiles(&context, |_| ()) {
                Ok(profiles) => profiles,
                Err(err) if err.is_cancelled() => return Ok(false),
                Err(err) => return Err(err),
            };

            let num_boxes = profiles.rows.len();
            let (increment, unit) =
                adjust_increment_unit(profiles.increment_arcsec, num_boxes);
            let values: Vec<f32> = profiles.rows.iter().map(|row| row[0] as f32).collect();

            callback(SpatialProfileData {
                file_id,
                region_id,
                x: center.x,
                y: center.y,
                channel: frame.current_z(),
                stokes: context.stokes,
                value: f32::NAN,
                profiles: vec![SpatialProfile {
                    coordinate: config.coordinate.clone(),
                    start: 0,
                    end: num_boxes,
                    mip: 1,
                    values,
                    crpix: (num_boxes as f64 - 1.0) / 2.0,
                    crval: 0.0,
                    cdelt: increment,
                    unit: unit.clone(),
                }],
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{handler_with_angular_frame, line_state};
    use approx::assert_relative_eq;
    use cube_core::requests::SpatialConfig;
    use cube_core::AxisRange;
    use cube_region::RegionStyle;

    fn pv_request(region_id: i32, width: usize, reverse: bool) -> PvRequest {
        PvRequest {
            file_id: 0,
            region_id,
            width,
            spectral_range: AxisRange::all(),
            reverse,
            keep: false,
        }
    }

    #[test]
    fn test_pv_scenario_s6() {
        // S6: horizontal line (10,50)-(110,50), width 1, 200x100x25 cube
        let (handler, _frame) = handler_with_angular_frame(200, 100, 25);
        let mut id = 0;
        handler
            .set_region(&mut id, line_state(0, 10.0, 50.0, 110.0, 50.0), RegionStyle::default())
            .unwrap();

        let response = handler.calculate_pv_image(&pv_request(id, 1, false), |_| ());
        assert!(response.success, "{}", response.message);
        let image = response.image.unwrap();

        // 101 boxes x 25 channels, offset axis in arcsec at |CDELT1|
        assert_eq!(image.shape.width(), 101);
        assert_eq!(image.shape.height(), 25);
        assert_eq!(image.csys.x.ctype, "OFFSET");
        assert_eq!(image.csys.x.cunit, "arcsec");
        assert_relative_eq!(image.csys.x.cdelt, 1.0, epsilon = 1e-6);
        assert_eq!(image.file_id, PV_ID_MULTIPLIER);

        // offsets run from the line end toward its start: box 0 sits at
        // x = 110 on the row-50 ramp; channel z adds a plane of 200*100
        let sample = image.data[0]; // z = 0, box 0
        let expected = (50 * 200 + 110) as f32;
        assert_relative_eq!(sample, expected);
        let z5 = image.data[5 * 101];
        assert_relative_eq!(z5, expected + (5 * 200 * 100) as f32);
    }

    #[test]
    fn test_reverse_pv_swaps_axes() {
        let (handler, _frame) = handler_with_angular_frame(64, 32, 8);
        let mut id = 0;
        handler
            .set_region(&mut id, line_state(0, 10.0, 16.0, 30.0, 16.0), RegionStyle::default())
            .unwrap();

        let normal = handler
            .calculate_pv_image(&pv_request(id, 1, false), |_| ())
            .image
            .unwrap();
        let reversed = handler
            .calculate_pv_image(&pv_request(id, 1, true), |_| ())
            .image
            .unwrap();

        assert_eq!(normal.shape.width(), reversed.shape.height());
        assert_eq!(normal.shape.height(), reversed.shape.width());
        assert_eq!(reversed.csys.y.ctype, "OFFSET");
        // transposed content
        let (nb, nz) = (normal.shape.width(), normal.shape.height());
        for b in 0..nb {
            for z in 0..nz {
                assert_relative_eq!(
                    normal.data[z * nb + b],
                    reversed.data[b * nz + z]
                );
            }
        }
    }

    #[test]
    fn test_pv_rejects_non_line() {
        let (handler, _frame) = handler_with_angular_frame(32, 32, 4);
        let mut id = 0;
        handler
            .set_region(
                &mut id,
                crate::testutil::rect_state(0, 5.0, 5.0, 2.0, 2.0),
                RegionStyle::default(),
            )
            .unwrap();
        let response = handler.calculate_pv_image(&pv_request(id, 1, false), |_| ());
        assert!(!response.success);
        assert!(!response.cancelled);
    }

    #[test]
    fn test_pv_stop_cancels() {
        let (handler, _frame) = handler_with_angular_frame(128, 64, 16);
        let mut id = 0;
        handler
            .set_region(&mut id, line_state(0, 5.0, 32.0, 120.0, 32.0), RegionStyle::default())
            .unwrap();

        // stop as soon as the first progress lands
        let response = handler.calculate_pv_image(&pv_request(id, 1, false), |_| {
            handler.stop_pv(0);
        });
        // either the run finished before the first report or it cancelled
        if !response.success {
            assert!(response.cancelled);
        }
    }

    #[test]
    fn test_pv_preview_shape() {
        let (handler, _frame) = handler_with_angular_frame(128, 64, 6);
        let mut id = 0;
        handler
            .set_region(&mut id, line_state(0, 10.0, 32.0, 90.0, 32.0), RegionStyle::default())
            .unwrap();

        let response =
            handler.calculate_pv_preview(&pv_request(id, 2, false), 2, |_| ());
        assert!(response.success, "{}", response.message);
        let image = response.image.unwrap();
        assert_eq!(image.shape.height(), 6);
        // preview line is half as long: 40 pixels -> 41 boxes
        assert_eq!(image.shape.width(), 41);
        assert!(image.name.ends_with(".preview"));
    }

    #[test]
    fn test_line_spatial_profile_stream() {
        let (handler, _frame) = handler_with_angular_frame(64, 64, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, line_state(0, 10.0, 20.0, 40.0, 20.0), RegionStyle::default())
            .unwrap();
        handler
            .set_spatial_requirements(
                id,
                0,
                vec![SpatialConfig {
                    coordinate: "x".to_string(),
                    start: 0,
                    end: 0,
                    mip: 1,
                    width: 1,
                }],
            )
            .unwrap();

        let mut messages = Vec::new();
        assert!(handler
            .fill_line_spatial_profile_data(id, 0, |m| messages.push(m))
            .unwrap());
        assert_eq!(messages.len(), 1);
        let profile = &messages[0].profiles[0];
        assert_eq!(profile.values.len(), 31);
        assert_eq!(profile.unit, "arcsec");
        assert!(profile.values.iter().all(|v| v.is_finite()));
    }
}
