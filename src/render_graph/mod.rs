//! Render Graph System
//!
//! A statically ordered list of passes. Each pass declares the shared images
//! it reads and writes and the descriptor bindings its shaders use; the graph
//! checks that every read has an earlier writer, builds every pass against
//! the current swapchain and records them in order into one command buffer.
//!
//! ```text
//!   add_pass ──► declare(PassIo) ──► binder declarations
//!   build    ──► create(PassBuildContext)      per swapchain
//!   record   ──► record(RecordContext)         per frame
//!   release  ──► destroy(PassTeardownContext)  reverse order
//! ```

pub mod graph;
pub mod pass;
pub mod pipeline;
pub mod resource;

pub use graph::*;
pub use pass::*;
pub use pipeline::*;
pub use resource::*;
