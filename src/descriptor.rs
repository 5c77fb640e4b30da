//! Descriptor binder
//!
//! Passes declare their bindings once; the binder turns declarations into
//! cached set layouts and writes concrete resources into sets allocated from
//! the graph's shared pool.
//!
//! ```text
//!   declare_binding(pass, set, binding, ty, stages)
//!          │
//!          ▼
//!   layout(pass, set) ──► cached DescriptorSetLayout
//!          │
//!          ▼
//!   build(pass, set, resources) ──► BoundSet
//!                                    ├─ 1 set         (static data)
//!                                    └─ 1 set / slot  (per-frame uniforms)
//! ```
//!
//! Per-frame sets are indexed by ring slot, never by swapchain image index:
//! the two counts are independent.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::frame::SlotIndex;
use crate::render_graph::PassId;
use crate::resources::UniformBuffer;
use std::collections::{BTreeMap, HashMap};

/// A resource to write into one binding
#[derive(Clone, Copy)]
pub enum BindingResource<'a> {
    Uniform(&'a dyn UniformBuffer),
    SampledImage {
        view: ImageViewHandle,
        sampler: SamplerHandle,
    },
    InputAttachment {
        view: ImageViewHandle,
    },
}

impl<'a> BindingResource<'a> {
    fn descriptor_type(&self) -> DescriptorType {
        match self {
            BindingResource::Uniform(_) => DescriptorType::UniformBuffer,
            BindingResource::SampledImage { .. } => DescriptorType::CombinedImageSampler,
            BindingResource::InputAttachment { .. } => DescriptorType::InputAttachment,
        }
    }

    fn copies(&self) -> usize {
        match self {
            BindingResource::Uniform(uniform) => uniform.copies(),
            _ => 1,
        }
    }

    fn resource(&self, slot: SlotIndex) -> DescriptorResource {
        match *self {
            BindingResource::Uniform(uniform) => uniform.descriptor_binding(slot).as_descriptor(),
            BindingResource::SampledImage { view, sampler } => DescriptorResource::Image {
                view,
                sampler: Some(sampler),
                layout: ImageLayout::ShaderReadOnly,
            },
            BindingResource::InputAttachment { view } => DescriptorResource::Image {
                view,
                sampler: None,
                layout: ImageLayout::ShaderReadOnly,
            },
        }
    }
}

/// Descriptor pool shared by every pass of a graph
pub struct DescriptorPool {
    handle: DescriptorPoolHandle,
    max_sets: u32,
}

impl DescriptorPool {
    /// Sized for `max_sets` sets of up to four bindings of each type.
    pub fn new(device: &mut dyn GpuDevice, max_sets: u32) -> BackendResult<Self> {
        let sizes = [
            DescriptorType::UniformBuffer,
            DescriptorType::CombinedImageSampler,
            DescriptorType::InputAttachment,
        ]
        .map(|ty| DescriptorPoolSize {
            ty,
            count: max_sets * 4,
        });
        let handle = device.create_descriptor_pool(&sizes, max_sets)?;
        Ok(Self { handle, max_sets })
    }

    pub fn handle(&self) -> DescriptorPoolHandle {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Free every set allocated from the pool.
    pub fn reset(&self, device: &mut dyn GpuDevice) -> BackendResult<()> {
        device.reset_descriptor_pool(self.handle)
    }

    pub fn destroy(self, device: &mut dyn GpuDevice) {
        device.destroy_descriptor_pool(self.handle);
    }
}

/// Descriptor sets for one (pass, set index), one per ring slot when the
/// bound data changes per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundSet {
    layout: DescriptorSetLayoutHandle,
    sets: Vec<DescriptorSetHandle>,
}

impl BoundSet {
    /// Set to bind while recording for `slot`
    pub fn select(&self, slot: SlotIndex) -> DescriptorSetHandle {
        self.sets[slot.0 % self.sets.len()]
    }

    pub fn is_per_frame(&self) -> bool {
        self.sets.len() > 1
    }

    pub fn sets(&self) -> &[DescriptorSetHandle] {
        &self.sets
    }

    pub fn layout(&self) -> DescriptorSetLayoutHandle {
        self.layout
    }
}

/// Maps declared bindings to layouts and writes descriptor sets
#[derive(Default)]
pub struct DescriptorBinder {
    declarations: BTreeMap<(PassId, u32), Vec<DescriptorSetLayoutBinding>>,
    layouts: HashMap<(PassId, u32), DescriptorSetLayoutHandle>,
}

impl DescriptorBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one binding of a pass's descriptor set.
    pub fn declare_binding(
        &mut self,
        pass: PassId,
        set: u32,
        binding: u32,
        ty: DescriptorType,
        stages: ShaderStages,
    ) -> BackendResult<()> {
        if self.layouts.contains_key(&(pass, set)) {
            return Err(BackendError::DescriptorFailed(format!(
                "pass {} set {}: binding {} declared after the layout was created",
                pass.index(),
                set,
                binding
            )));
        }
        let bindings = self.declarations.entry((pass, set)).or_default();
        if bindings.iter().any(|b| b.binding == binding) {
            return Err(BackendError::DescriptorFailed(format!(
                "pass {} set {}: binding {} declared twice",
                pass.index(),
                set,
                binding
            )));
        }
        bindings.push(DescriptorSetLayoutBinding {
            binding,
            ty,
            stages,
        });
        bindings.sort_by_key(|b| b.binding);
        Ok(())
    }

    /// Declared bindings of a set, ordered by binding number
    pub fn bindings(&self, pass: PassId, set: u32) -> &[DescriptorSetLayoutBinding] {
        self.declarations
            .get(&(pass, set))
            .map(|b| b.as_slice())
            .unwrap_or(&[])
    }

    /// Number of consecutive sets (from 0) a pass declared
    pub fn set_count(&self, pass: PassId) -> u32 {
        let mut count = 0;
        while self.declarations.contains_key(&(pass, count)) {
            count += 1;
        }
        count
    }

    /// Set layout for (pass, set), created on first use and cached.
    pub fn layout(
        &mut self,
        device: &mut dyn GpuDevice,
        pass: PassId,
        set: u32,
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        if let Some(layout) = self.layouts.get(&(pass, set)) {
            return Ok(*layout);
        }
        let bindings = self.declarations.get(&(pass, set)).ok_or_else(|| {
            BackendError::DescriptorFailed(format!(
                "pass {} set {} has no declared bindings",
                pass.index(),
                set
            ))
        })?;
        let layout = device.create_descriptor_set_layout(bindings)?;
        log::trace!(
            "Created set layout for pass {} set {} ({} bindings)",
            pass.index(),
            set,
            bindings.len()
        );
        self.layouts.insert((pass, set), layout);
        Ok(layout)
    }

    /// Layouts of every declared set of a pass, for its pipeline layout
    pub fn pass_layouts(
        &mut self,
        device: &mut dyn GpuDevice,
        pass: PassId,
    ) -> BackendResult<Vec<DescriptorSetLayoutHandle>> {
        (0..self.set_count(pass))
            .map(|set| self.layout(device, pass, set))
            .collect()
    }

    /// Allocate and write the sets for (pass, set).
    ///
    /// `resources` are matched to the declared bindings in binding order.
    /// If any uniform keeps one copy per ring slot, one set is written per
    /// slot, each pointing at that slot's copy.
    pub fn build(
        &mut self,
        device: &mut dyn GpuDevice,
        pool: &DescriptorPool,
        pass: PassId,
        set: u32,
        resources: &[BindingResource],
    ) -> BackendResult<BoundSet> {
        let layout = self.layout(device, pass, set)?;
        let bindings = self.bindings(pass, set);
        if bindings.len() != resources.len() {
            return Err(BackendError::DescriptorFailed(format!(
                "pass {} set {}: {} resources for {} declared bindings",
                pass.index(),
                set,
                resources.len(),
                bindings.len()
            )));
        }
        for (binding, resource) in bindings.iter().zip(resources) {
            if binding.ty != resource.descriptor_type() {
                return Err(BackendError::DescriptorFailed(format!(
                    "pass {} set {} binding {}: declared {:?}, given {:?}",
                    pass.index(),
                    set,
                    binding.binding,
                    binding.ty,
                    resource.descriptor_type()
                )));
            }
        }

        let copies = resources.iter().map(|r| r.copies()).max().unwrap_or(1);
        if resources
            .iter()
            .any(|r| r.copies() != 1 && r.copies() != copies)
        {
            return Err(BackendError::DescriptorFailed(format!(
                "pass {} set {}: uniforms disagree on the number of copies",
                pass.index(),
                set
            )));
        }

        let writes_for = |slot: SlotIndex| -> Vec<DescriptorWrite> {
            bindings
                .iter()
                .zip(resources)
                .map(|(binding, resource)| DescriptorWrite {
                    binding: binding.binding,
                    ty: binding.ty,
                    resource: resource.resource(slot),
                })
                .collect()
        };

        let mut sets = Vec::with_capacity(copies);
        for copy in 0..copies {
            let handle = device.allocate_descriptor_set(pool.handle(), layout)?;
            device.update_descriptor_set(handle, &writes_for(SlotIndex(copy)))?;
            sets.push(handle);
        }

        Ok(BoundSet { layout, sets })
    }

    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for (_, layout) in self.layouts.drain() {
            device.destroy_descriptor_set_layout(layout);
        }
        self.declarations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessDevice};
    use crate::resources::{ResourceAllocator, RingUniformBuffer, StaticUniformBuffer};

    const PASS: PassId = PassId(0);

    #[test]
    fn test_duplicate_binding_rejected() {
        let mut binder = DescriptorBinder::new();
        binder
            .declare_binding(PASS, 0, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .unwrap();
        assert!(binder
            .declare_binding(PASS, 0, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .is_err());
        assert!(binder
            .declare_binding(PASS, 1, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .is_ok());
        assert_eq!(binder.set_count(PASS), 2);
    }

    #[test]
    fn test_layout_is_cached() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut binder = DescriptorBinder::new();
        binder
            .declare_binding(PASS, 0, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .unwrap();
        let a = binder.layout(&mut device, PASS, 0).unwrap();
        let b = binder.layout(&mut device, PASS, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.call_log_handle().live("descriptor_set_layout").len(), 1);
    }

    #[test]
    fn test_ring_uniform_builds_one_set_per_slot() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let pool = DescriptorPool::new(&mut device, 8).unwrap();
        let camera = RingUniformBuffer::new(&mut device, &mut allocator, "camera", 64, 3).unwrap();

        let mut binder = DescriptorBinder::new();
        binder
            .declare_binding(PASS, 0, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .unwrap();
        let bound = binder
            .build(&mut device, &pool, PASS, 0, &[BindingResource::Uniform(&camera)])
            .unwrap();

        assert!(bound.is_per_frame());
        assert_eq!(bound.sets().len(), 3);
        assert_ne!(bound.select(SlotIndex(0)), bound.select(SlotIndex(1)));
        assert_eq!(bound.select(SlotIndex(4)), bound.select(SlotIndex(1)));
    }

    #[test]
    fn test_static_uniform_builds_single_set() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let pool = DescriptorPool::new(&mut device, 8).unwrap();
        let light =
            StaticUniformBuffer::with_contents(&mut device, &mut allocator, "light", &[0; 32])
                .unwrap();

        let mut binder = DescriptorBinder::new();
        binder
            .declare_binding(PASS, 1, 0, DescriptorType::UniformBuffer, ShaderStages::FRAGMENT)
            .unwrap();
        let bound = binder
            .build(&mut device, &pool, PASS, 1, &[BindingResource::Uniform(&light)])
            .unwrap();
        assert!(!bound.is_per_frame());
        assert_eq!(bound.select(SlotIndex(0)), bound.select(SlotIndex(2)));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let pool = DescriptorPool::new(&mut device, 8).unwrap();
        let mut binder = DescriptorBinder::new();
        binder
            .declare_binding(PASS, 0, 0, DescriptorType::UniformBuffer, ShaderStages::VERTEX)
            .unwrap();
        let view = ImageViewHandle(99);
        assert!(binder
            .build(&mut device, &pool, PASS, 0, &[BindingResource::InputAttachment { view }])
            .is_err());
    }
}
