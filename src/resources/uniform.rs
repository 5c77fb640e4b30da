//! Uniform buffers
//!
//! One capability interface, two implementations: a single static copy for
//! data written once, and one copy per frame-ring slot for data that changes
//! every frame.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::frame::SlotIndex;
use crate::resources::allocator::{GpuBuffer, ResourceAllocator};

/// Buffer range a descriptor binding points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub range: u64,
}

impl BufferBinding {
    pub fn as_descriptor(&self) -> DescriptorResource {
        DescriptorResource::Buffer {
            buffer: self.buffer,
            offset: self.offset,
            range: self.range,
        }
    }
}

/// Host-writable uniform data that can be bound to a descriptor.
pub trait UniformBuffer {
    /// Write `bytes` into the copy used by `slot`.
    fn write(&mut self, device: &mut dyn GpuDevice, slot: SlotIndex, bytes: &[u8])
        -> BackendResult<()>;

    /// Binding for the copy used by `slot`.
    fn descriptor_binding(&self, slot: SlotIndex) -> BufferBinding;

    /// Number of distinct copies (1 for static data).
    fn copies(&self) -> usize;

    /// Size of one copy in bytes
    fn size(&self) -> u64;
}

fn check_len(name: &str, size: u64, bytes: &[u8]) -> BackendResult<()> {
    if bytes.len() as u64 > size {
        return Err(BackendError::Validation(format!(
            "{} bytes written into uniform '{}' of {} bytes",
            bytes.len(),
            name,
            size
        )));
    }
    Ok(())
}

/// Uniform data shared by every frame in flight.
///
/// Writing while a frame that reads it is in flight is a race; use it for
/// data that is written at setup time.
pub struct StaticUniformBuffer {
    buffer: GpuBuffer,
}

impl StaticUniformBuffer {
    pub fn new(
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        name: &str,
        size: u64,
    ) -> BackendResult<Self> {
        let buffer = allocator.create_buffer(
            device,
            name,
            size,
            BufferUsage::UNIFORM,
            MemoryLocation::CpuToGpu,
        )?;
        Ok(Self { buffer })
    }

    /// Create and fill in one step.
    pub fn with_contents(
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        name: &str,
        bytes: &[u8],
    ) -> BackendResult<Self> {
        let mut uniform = Self::new(device, allocator, name, bytes.len() as u64)?;
        uniform.write(device, SlotIndex(0), bytes)?;
        Ok(uniform)
    }

    pub fn destroy(self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        allocator.destroy(device, self.buffer);
    }
}

impl UniformBuffer for StaticUniformBuffer {
    fn write(
        &mut self,
        device: &mut dyn GpuDevice,
        _slot: SlotIndex,
        bytes: &[u8],
    ) -> BackendResult<()> {
        check_len(&self.buffer.name, self.buffer.size, bytes)?;
        device.write_buffer(self.buffer.buffer, 0, bytes)
    }

    fn descriptor_binding(&self, _slot: SlotIndex) -> BufferBinding {
        BufferBinding {
            buffer: self.buffer.buffer,
            offset: 0,
            range: self.buffer.size,
        }
    }

    fn copies(&self) -> usize {
        1
    }

    fn size(&self) -> u64 {
        self.buffer.size
    }
}

/// Uniform data with one copy per frame-ring slot.
///
/// Copies are indexed by [`SlotIndex`], so writing the active slot's copy
/// after its fence wait never races the GPU reading another slot's copy.
pub struct RingUniformBuffer {
    buffers: Vec<GpuBuffer>,
    size: u64,
}

impl RingUniformBuffer {
    pub fn new(
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        name: &str,
        size: u64,
        ring_size: usize,
    ) -> BackendResult<Self> {
        let mut buffers = Vec::with_capacity(ring_size);
        for slot in 0..ring_size {
            match allocator.create_buffer(
                device,
                &format!("{}[{}]", name, slot),
                size,
                BufferUsage::UNIFORM,
                MemoryLocation::CpuToGpu,
            ) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        allocator.destroy(device, buffer);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { buffers, size })
    }

    pub fn destroy(self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        for buffer in self.buffers {
            allocator.destroy(device, buffer);
        }
    }

    fn copy(&self, slot: SlotIndex) -> &GpuBuffer {
        &self.buffers[slot.0 % self.buffers.len()]
    }
}

impl UniformBuffer for RingUniformBuffer {
    fn write(
        &mut self,
        device: &mut dyn GpuDevice,
        slot: SlotIndex,
        bytes: &[u8],
    ) -> BackendResult<()> {
        let buffer = self.copy(slot);
        check_len(&buffer.name, self.size, bytes)?;
        device.write_buffer(buffer.buffer, 0, bytes)
    }

    fn descriptor_binding(&self, slot: SlotIndex) -> BufferBinding {
        BufferBinding {
            buffer: self.copy(slot).buffer,
            offset: 0,
            range: self.size,
        }
    }

    fn copies(&self) -> usize {
        self.buffers.len()
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessDevice};

    #[test]
    fn test_static_uniform_single_copy() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let uniform =
            StaticUniformBuffer::with_contents(&mut device, &mut allocator, "light", &[1, 2, 3, 4])
                .unwrap();

        assert_eq!(uniform.copies(), 1);
        assert_eq!(
            uniform.descriptor_binding(SlotIndex(0)),
            uniform.descriptor_binding(SlotIndex(2))
        );
        let binding = uniform.descriptor_binding(SlotIndex(0));
        assert_eq!(
            device.read_buffer(binding.buffer, 0, 4).unwrap(),
            vec![1, 2, 3, 4]
        );
        uniform.destroy(&mut device, &mut allocator);
    }

    #[test]
    fn test_ring_uniform_writes_only_active_slot() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let mut uniform =
            RingUniformBuffer::new(&mut device, &mut allocator, "camera", 4, 3).unwrap();

        uniform.write(&mut device, SlotIndex(1), &[9, 9, 9, 9]).unwrap();

        let slot0 = uniform.descriptor_binding(SlotIndex(0));
        let slot1 = uniform.descriptor_binding(SlotIndex(1));
        assert_ne!(slot0.buffer, slot1.buffer);
        assert_eq!(device.read_buffer(slot1.buffer, 0, 4).unwrap(), vec![9; 4]);
        assert_eq!(device.read_buffer(slot0.buffer, 0, 4).unwrap(), vec![0; 4]);
        uniform.destroy(&mut device, &mut allocator);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let mut uniform =
            RingUniformBuffer::new(&mut device, &mut allocator, "camera", 4, 2).unwrap();
        assert!(uniform.write(&mut device, SlotIndex(0), &[0u8; 8]).is_err());
    }
}
