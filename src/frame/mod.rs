//! Frames in flight
//!
//! The [`FrameRing`] bounds how far the CPU may run ahead of the GPU. Each
//! slot owns a fence, an image-available semaphore, a render-finished
//! semaphore and a command pool with one primary buffer.
//!
//! | Count | Behavior |
//! |-------|----------|
//! | 1 | CPU waits for GPU every frame. |
//! | 2 | CPU records frame N+1 while the GPU renders frame N. |
//! | 3 | More latency tolerance at the cost of input lag. |

pub mod ring;

pub use ring::*;
