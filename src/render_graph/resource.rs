//! Shared images of the render graph
//!
//! A pass that produces an image other passes consume registers it here by
//! name. Later passes look it up by reference; ownership stays with the
//! table until the producing pass releases it.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::pass::PassId;
use crate::resources::GpuImage;
use std::collections::BTreeMap;

/// Unique identifier for a render graph resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u32);

/// An image produced by one pass for consumption by later passes
#[derive(Debug, Clone)]
pub struct SharedImage {
    pub id: ResourceId,
    pub owner: PassId,
    pub image: GpuImage,
    /// Layout the image is left in when its owner's pass ends
    pub layout: ImageLayout,
}

#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: BTreeMap<String, SharedImage>,
    next_id: u32,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an image under `name`. The table takes ownership.
    pub fn register(
        &mut self,
        owner: PassId,
        name: &str,
        image: GpuImage,
        layout: ImageLayout,
    ) -> BackendResult<ResourceId> {
        if let Some(existing) = self.entries.get(name) {
            return Err(BackendError::Validation(format!(
                "shared image '{}' already registered by pass {}",
                name,
                existing.owner.index()
            )));
        }
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            name.to_string(),
            SharedImage {
                id,
                owner,
                image,
                layout,
            },
        );
        Ok(id)
    }

    pub fn get(&self, name: &str) -> BackendResult<&SharedImage> {
        self.entries
            .get(name)
            .ok_or_else(|| BackendError::ResourceNotFound(format!("shared image '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Remove and return every image registered by `owner`.
    pub fn release_owned(&mut self, owner: PassId) -> Vec<GpuImage> {
        let names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.entries.remove(&name))
            .map(|entry| entry.image)
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, id: u64) -> GpuImage {
        GpuImage {
            name: name.into(),
            image: ImageHandle(id),
            view: ImageViewHandle(id),
            layer_views: Vec::new(),
            format: Format::R32Float,
            extent: Extent2D::new(4, 4),
            array_layers: 1,
            usage: ImageUsage::SAMPLED,
        }
    }

    #[test]
    fn test_register_and_release() {
        let mut table = ResourceTable::new();
        table
            .register(PassId(0), "views", image("views", 1), ImageLayout::ShaderReadOnly)
            .unwrap();
        table
            .register(PassId(1), "gradients", image("gradients", 2), ImageLayout::ShaderReadOnly)
            .unwrap();

        assert_eq!(table.get("views").unwrap().owner, PassId(0));
        let released = table.release_owned(PassId(0));
        assert_eq!(released.len(), 1);
        assert!(!table.contains("views"));
        assert!(table.contains("gradients"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut table = ResourceTable::new();
        table
            .register(PassId(0), "a", image("a", 1), ImageLayout::General)
            .unwrap();
        assert!(table
            .register(PassId(1), "a", image("a", 2), ImageLayout::General)
            .is_err());
    }
}
