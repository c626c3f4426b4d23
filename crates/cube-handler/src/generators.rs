//! Generator dispatch: moments and image fitting across regions.
//!
//! The handler resolves the (region, file) pair into a concrete
//! [`StokesRegion`] and hands off to the frame's generator. Field-of-view
//! fitting (region id 0) builds an ephemeral region from the supplied
//! state; it never enters the public id namespace and disappears with
//! the call regardless of outcome.

use crate::handler::RegionHandler;
use cube_core::messages::{FittingResponse, MomentResponse};
use cube_core::requests::{FittingRequest, MomentRequest};
use cube_core::IMAGE_REGION_ID;
use cube_region::{RegionMask, StokesRegion};

impl RegionHandler {
    /// Runs the moment generator over a region (or the whole image for
    /// [`IMAGE_REGION_ID`]) at the frame's current Stokes.
    pub fn calculate_moments(
        &self,
        request: &MomentRequest,
        progress: impl FnMut(f64),
    ) -> MomentResponse {
        let failed = |message: &str| MomentResponse {
            success: false,
            cancelled: false,
            message: message.to_string(),
            images: vec![],
        };
        let Some(frame) = self.frame(request.file_id) else {
            return failed("file is not open");
        };
        let Ok((z_from, z_to)) = request
            .spectral_range
            .resolve(frame.depth(), frame.current_z())
        else {
            return failed("bad spectral range");
        };

        let mask = if request.region_id == IMAGE_REGION_ID {
            Some(full_image_mask(frame.width(), frame.height()))
        } else {
            self.apply_region_to_file(request.region_id, request.file_id)
        };
        let Some(mask) = mask else {
            return failed("region does not intersect the image");
        };

        let stokes_region = StokesRegion {
            mask,
            z_from,
            z_to,
            stokes: frame.current_stokes(),
        };
        frame.calculate_moments(&stokes_region, request, progress)
    }

    /// Runs the image fitter.
    ///
    /// Region id 0 fits inside an ephemeral field-of-view region built
    /// from `fov_state`; [`IMAGE_REGION_ID`] fits the whole plane.
    pub fn fit_image(
        &self,
        request: &FittingRequest,
        fov_state: Option<&cube_region::RegionState>,
    ) -> FittingResponse {
        let failed = |message: &str| FittingResponse {
            success: false,
            message: message.to_string(),
            components: vec![],
            errors: vec![],
            integrated_flux: vec![],
            log: String::new(),
            model: None,
            residual: None,
        };
        let Some(frame) = self.frame(request.file_id) else {
            return failed("file is not open");
        };

        let region = if request.region_id == IMAGE_REGION_ID {
            None
        } else if request.region_id == 0 {
            // ephemeral field-of-view region scoped to this call
            let Some(state) = fov_state else {
                return failed("field-of-view fit without a field of view");
            };
            let Some(mask) = self.apply_state_to_frame(state, &frame, request.file_id)
            else {
                return failed("field of view does not intersect the image");
            };
            Some(StokesRegion {
                mask,
                z_from: frame.current_z(),
                z_to: frame.current_z(),
                stokes: frame.current_stokes(),
            })
        } else {
            let Some(mask) = self.apply_region_to_file(request.region_id, request.file_id)
            else {
                return failed("region does not intersect the image");
            };
            Some(StokesRegion {
                mask,
                z_from: frame.current_z(),
                z_to: frame.current_z(),
                stokes: frame.current_stokes(),
            })
        };

        frame.fit_image(request, region.as_ref())
    }
}

fn full_image_mask(width: usize, height: usize) -> RegionMask {
    RegionMask {
        origin: (0, 0),
        width,
        height,
        mask: vec![true; width * height],
    }
}
