//! GPU resource management
//!
//! Images, buffers, uniform buffers and static meshes, all created through
//! the [`ResourceAllocator`].

pub mod allocator;
pub mod mesh;
pub mod uniform;

pub use allocator::*;
pub use mesh::*;
pub use uniform::*;
