//! Backend abstraction layer
//!
//! Provides the device seam and the types both the Vulkan and the headless
//! devices implement.

pub mod headless;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
pub mod vulkan;

pub use traits::*;
pub use types::*;
