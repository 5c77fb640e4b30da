//! Static geometry
//!
//! Meshes are non-indexed triangle lists uploaded once through the staging
//! path into device-local vertex buffers.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::allocator::{GpuBuffer, ResourceAllocator};
use glam::Vec3;

/// CPU-side triangle list
#[derive(Debug, Clone)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vertices: Vec::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Two triangles spanning [-1, 1] in x and y at z = 0, facing +Z.
    pub fn quad(color: [f32; 4]) -> Self {
        let mut mesh = Mesh::new("quad");
        let corners = [
            ([-1.0, -1.0], [0.0, 1.0]),
            ([1.0, -1.0], [1.0, 1.0]),
            ([1.0, 1.0], [1.0, 0.0]),
            ([-1.0, 1.0], [0.0, 0.0]),
        ];
        for i in [0usize, 1, 2, 0, 2, 3] {
            let ([x, y], uv) = corners[i];
            mesh.vertices
                .push(Vertex::new([x, y, 0.0], [0.0, 0.0, 1.0], color, uv));
        }
        mesh
    }

    /// Unit cube centered at the origin with per-face normals.
    pub fn cube(color: [f32; 4]) -> Self {
        let mut mesh = Mesh::new("cube");
        let faces = [Vec3::Z, -Vec3::Z, Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y];

        for normal in faces {
            // Two axes spanning the face, chosen so u x v = normal.
            let u = if normal.y.abs() > 0.9 {
                Vec3::X
            } else {
                Vec3::Y.cross(normal).normalize()
            };
            let v = normal.cross(u);
            let center = normal * 0.5;
            let corners = [
                (center - u * 0.5 - v * 0.5, [0.0, 1.0]),
                (center + u * 0.5 - v * 0.5, [1.0, 1.0]),
                (center + u * 0.5 + v * 0.5, [1.0, 0.0]),
                (center - u * 0.5 + v * 0.5, [0.0, 0.0]),
            ];
            for i in [0usize, 1, 2, 0, 2, 3] {
                let (p, uv) = corners[i];
                mesh.vertices
                    .push(Vertex::new(p.to_array(), normal.to_array(), color, uv));
            }
        }
        mesh
    }
}

/// Which graph draws a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshTag {
    Deferred,
    Lightfield,
}

/// A mesh resident in a device-local vertex buffer
#[derive(Debug)]
pub struct StaticMesh {
    pub name: String,
    pub tag: MeshTag,
    pub buffer: GpuBuffer,
    pub vertex_count: u32,
}

impl StaticMesh {
    pub fn upload(
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        mesh: &Mesh,
        tag: MeshTag,
    ) -> BackendResult<Self> {
        let bytes = mesh.vertex_bytes();
        let buffer = allocator.create_buffer(
            device,
            &format!("{}.vertices", mesh.name),
            bytes.len().max(1) as u64,
            BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        if let Err(e) = allocator.upload(device, &buffer, bytes) {
            allocator.destroy(device, buffer);
            return Err(e);
        }

        Ok(Self {
            name: mesh.name.clone(),
            tag,
            buffer,
            vertex_count: mesh.vertex_count() as u32,
        })
    }

    /// Bind and draw the whole triangle list.
    pub fn draw(&self, device: &mut dyn GpuDevice, cmd: CommandBufferHandle) {
        device.cmd_bind_vertex_buffer(cmd, self.buffer.buffer);
        device.cmd_draw(cmd, self.vertex_count, 1);
    }

    pub fn destroy(self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        allocator.destroy(device, self.buffer);
    }
}

/// Renderable geometry, tagged by the graph that draws it
#[derive(Debug, Default)]
pub struct Scene {
    meshes: Vec<StaticMesh>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        device: &mut dyn GpuDevice,
        allocator: &mut ResourceAllocator,
        mesh: &Mesh,
        tag: MeshTag,
    ) -> BackendResult<()> {
        self.meshes
            .push(StaticMesh::upload(device, allocator, mesh, tag)?);
        Ok(())
    }

    pub fn tagged(&self, tag: MeshTag) -> impl Iterator<Item = &StaticMesh> {
        self.meshes.iter().filter(move |m| m.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    pub fn destroy(&mut self, device: &mut dyn GpuDevice, allocator: &mut ResourceAllocator) {
        for mesh in self.meshes.drain(..) {
            mesh.destroy(device, allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessConfig, HeadlessDevice};

    #[test]
    fn test_cube_has_outward_normals() {
        let cube = Mesh::cube([1.0; 4]);
        assert_eq!(cube.vertex_count(), 36);
        for v in &cube.vertices {
            let p = Vec3::from_array(v.position);
            let n = Vec3::from_array(v.normal);
            assert!((p.dot(n) - 0.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_quad_winding_faces_normal() {
        let quad = Mesh::quad([0.5, 0.25, 1.0, 1.0]);
        let tri = &quad.vertices[0..3];
        let a = Vec3::from_array(tri[0].position);
        let b = Vec3::from_array(tri[1].position);
        let c = Vec3::from_array(tri[2].position);
        assert!((b - a).cross(c - a).z > 0.0);
    }

    #[test]
    fn test_static_mesh_upload_round_trip() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let mesh = Mesh::cube([1.0, 0.0, 0.0, 1.0]);
        let gpu = StaticMesh::upload(&mut device, &mut allocator, &mesh, MeshTag::Lightfield)
            .unwrap();

        assert_eq!(gpu.vertex_count, 36);
        assert_eq!(
            device.buffer_contents(gpu.buffer.buffer).unwrap(),
            mesh.vertex_bytes()
        );
        gpu.destroy(&mut device, &mut allocator);
    }

    #[test]
    fn test_scene_filters_by_tag() {
        let mut device = HeadlessDevice::new(HeadlessConfig::default());
        let mut allocator = ResourceAllocator::new(&mut device).unwrap();
        let mut scene = Scene::new();
        scene
            .add(&mut device, &mut allocator, &Mesh::quad([1.0; 4]), MeshTag::Deferred)
            .unwrap();
        scene
            .add(&mut device, &mut allocator, &Mesh::cube([1.0; 4]), MeshTag::Lightfield)
            .unwrap();

        assert_eq!(scene.tagged(MeshTag::Deferred).count(), 1);
        assert_eq!(scene.tagged(MeshTag::Lightfield).next().unwrap().vertex_count, 36);
        scene.destroy(&mut device, &mut allocator);
        assert!(scene.is_empty());
    }
}
