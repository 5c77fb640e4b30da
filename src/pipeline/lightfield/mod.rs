//! Lightfield capture graph
//!
//! Four render passes in sequence. Each stage's output is sampled or read
//! by the next one as a whole image, so they are separate passes rather
//! than subpasses.
//!
//! ```text
//! forward ×9 ──► lightfield.views (array, 9 layers)
//!                    │ reference layer, sampled
//!                    ▼
//! gradients  ──► lightfield.gradients (R32F)
//!                    │
//!                    ▼
//! disparity  ──► lightfield.disparity (RGBA8, stub)
//!                    │ input attachment (configurable source)
//!                    ▼
//! swapchain write ──► presentable image + overlay
//! ```

pub mod disparity;
pub mod forward;
pub mod gradients;
pub mod swapchain_write;

pub use disparity::DisparityPass;
pub use forward::{ForwardPass, ForwardPushConstants};
pub use gradients::{GradientMode, GradientPushConstants, GradientsPass};
pub use swapchain_write::SwapchainWritePass;

use crate::backend::traits::*;
use crate::backend::types::Format;
use crate::camera::LIGHTFIELD_VIEWS;

pub const FORWARD_PROGRAM: &str = "lightfield.forward";
pub const GRADIENTS_PROGRAM: &str = "lightfield.gradients";
pub const SWAPCHAIN_WRITE_PROGRAM: &str = "lightfield.swapchain_write";

/// Shared image names
pub const VIEWS: &str = "lightfield.views";
pub const GRADIENTS: &str = "lightfield.gradients";
pub const DISPARITY: &str = "lightfield.disparity";

/// Which image the swapchain write pass presents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentSource {
    /// The reference layer of the forward views
    ForwardView,
    Gradients,
    #[default]
    Disparity,
}

impl PresentSource {
    pub fn resource(&self) -> &'static str {
        match self {
            PresentSource::ForwardView => VIEWS,
            PresentSource::Gradients => GRADIENTS,
            PresentSource::Disparity => DISPARITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightfieldConfig {
    /// Format of each forward view layer
    pub view_format: Format,
    pub gradient_mode: GradientMode,
    /// Forward layer the gradients pass samples
    pub reference_layer: u32,
    /// Distance between neighboring cameras in view space
    pub baseline: f32,
    pub present_source: PresentSource,
}

impl Default for LightfieldConfig {
    fn default() -> Self {
        Self {
            view_format: Format::Rgba8Unorm,
            gradient_mode: GradientMode::Magnitude,
            reference_layer: (LIGHTFIELD_VIEWS / 2) as u32,
            baseline: 0.1,
            present_source: PresentSource::Disparity,
        }
    }
}

impl LightfieldConfig {
    pub fn validate(&self) -> BackendResult<()> {
        if self.reference_layer as usize >= LIGHTFIELD_VIEWS {
            return Err(BackendError::Validation(format!(
                "reference layer {} of {} views",
                self.reference_layer, LIGHTFIELD_VIEWS
            )));
        }
        if self.view_format.is_depth() || self.view_format.bytes_per_pixel().is_none() {
            return Err(BackendError::Validation(format!(
                "{:?} cannot be a lightfield view format",
                self.view_format
            )));
        }
        if !self.baseline.is_finite() {
            return Err(BackendError::Validation("non-finite camera baseline".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = LightfieldConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reference_layer, 4);
        assert_eq!(config.present_source.resource(), DISPARITY);
    }

    #[test]
    fn test_reference_layer_out_of_range() {
        let config = LightfieldConfig {
            reference_layer: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_depth_view_format_rejected() {
        let config = LightfieldConfig {
            view_format: Format::Depth32Float,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
