//! Element types stored in particle buffers.
//!
//! Everything here is `Pod` so a buffer can always be viewed as raw bytes for
//! transfer between devices and nodes.

use bytemuck::{Pod, Zeroable};

/// Two packed `f32` values.
pub type Float2 = [f32; 2];
/// Three packed `f32` values.
pub type Float3 = [f32; 3];
/// Four packed `f32` values (xyz + w, where w is usually the mass).
pub type Float4 = [f32; 4];
/// Four packed `f64` values.
pub type Double4 = [f64; 4];
/// Linearized cell hash of a particle.
pub type HashKey = u32;
/// One entry of a neighbor list.
pub type NeibData = u16;
/// Ids of the three vertices of a boundary element, plus padding.
pub type VertexInfo = [u32; 4];

/// Particle type tag stored next to every particle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ParticleInfo {
    /// Particle kind (fluid, boundary, vertex, probe ...) and flags.
    pub kind: u16,
    /// Object (rigid body, fluid number) the particle belongs to.
    pub object: u16,
    /// Persistent particle id.
    pub id: u32,
}

impl ParticleInfo {
    /// Kind value used for fluid particles.
    pub const FLUID: u16 = 0;
    /// Kind value used for boundary particles.
    pub const BOUNDARY: u16 = 1;

    /// Build an info record for a fluid particle with the given id.
    pub fn fluid(id: u32) -> Self {
        Self {
            kind: Self::FLUID,
            object: 0,
            id,
        }
    }

    /// Build an info record for a boundary particle with the given id.
    pub fn boundary(id: u32) -> Self {
        Self {
            kind: Self::BOUNDARY,
            object: 0,
            id,
        }
    }

    /// Whether the particle is fluid.
    pub fn is_fluid(&self) -> bool {
        self.kind == Self::FLUID
    }
}
