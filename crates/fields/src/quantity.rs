//! Quantities, buffer keys and buffer families.
//!
//! Every per-particle quantity is a zero-sized type implementing [`Quantity`].
//! The trait binds one [`BufferKey`] bit to one element type and one
//! [`Family`], so looking up "the buffer for key K" through the typed API can
//! never hand back another quantity's data.

use bytemuck::Pod;

use crate::types::{
    Double4, Float2, Float3, Float4, HashKey, NeibData, ParticleInfo, VertexInfo,
};

bitflags::bitflags! {
    /// Buffer key set.
    ///
    /// A value with a single bit set identifies one quantity; unions name
    /// several quantities at once (for swaps, dumps and uploads).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BufferKey: u64 {
        /// Positions in double precision (host side).
        const POS_DOUBLE = 1 << 0;
        /// Positions (xyz) and mass (w).
        const POS = 1 << 1;
        /// Particle cell hash.
        const HASH = 1 << 2;
        /// Particle index before sorting.
        const PART_INDEX = 1 << 3;
        /// First particle of each cell.
        const CELL_START = 1 << 4;
        /// One past the last particle of each cell.
        const CELL_END = 1 << 5;
        /// Neighbor list.
        const NEIBS_LIST = 1 << 6;
        /// Forces (xyz) and density derivative (w).
        const FORCES = 1 << 7;
        /// XSPH velocity correction.
        const XSPH = 1 << 8;
        /// Velocity (xyz) and density (w).
        const VEL = 1 << 9;
        /// Particle info.
        const INFO = 1 << 10;
        /// Boundary element normals and surface.
        const BOUND_ELEMENTS = 1 << 11;
        /// Gradient of gamma (xyz) and gamma (w).
        const GRAD_GAMMA = 1 << 12;
        /// Boundary element vertices.
        const VERTICES = 1 << 13;
        /// Pressure.
        const PRESSURE = 1 << 14;
        /// Turbulent kinetic energy.
        const TKE = 1 << 15;
        /// Turbulent dissipation rate.
        const EPSILON = 1 << 16;
        /// Turbulent viscosity.
        const TURB_VISC = 1 << 17;
        /// Strain rate.
        const STRAIN_RATE = 1 << 18;
        /// Vorticity.
        const VORTICITY = 1 << 19;
        /// Surface normals.
        const NORMALS = 1 << 20;
        /// SPS stress tensor components.
        const TAU = 1 << 21;
        /// Per-block CFL partial reductions.
        const CFL = 1 << 22;
        /// Scratch space for the CFL reduction.
        const CFL_TEMP = 1 << 23;

        /// Common shortcut for the particle state.
        const POS_VEL_INFO = Self::POS.bits() | Self::VEL.bits() | Self::INFO.bits();

        /// Every double-buffered quantity.
        const ALL_DOUBLE = Self::POS.bits()
            | Self::VEL.bits()
            | Self::INFO.bits()
            | Self::BOUND_ELEMENTS.bits()
            | Self::GRAD_GAMMA.bits()
            | Self::VERTICES.bits()
            | Self::PRESSURE.bits()
            | Self::TKE.bits()
            | Self::EPSILON.bits()
            | Self::TURB_VISC.bits()
            | Self::STRAIN_RATE.bits();
    }
}

impl BufferKey {
    /// Iterate over the single-bit keys contained in this set, lowest first.
    pub fn single_keys(self) -> impl Iterator<Item = BufferKey> {
        let bits = self.bits();
        (0..u64::BITS)
            .map(|shift| 1u64 << shift)
            .filter(move |bit| bits & bit != 0)
            .map(BufferKey::from_bits_retain)
    }

    /// Quantity name for a single-bit key, if it is a known quantity.
    pub fn name(self) -> Option<&'static str> {
        QuantityInfo::lookup(self).map(|info| info.name)
    }
}

/// Runtime tag of a buffer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyKind {
    /// One array, elements can be reordered.
    Plain,
    /// Two arrays (read and write generations), elements can be reordered.
    DoubleBuffered,
    /// One array holding partial reductions; reordering is meaningless.
    ReductionOnly,
}

impl FamilyKind {
    /// Number of arrays a buffer of this family owns.
    pub const fn arrays(self) -> usize {
        match self {
            FamilyKind::DoubleBuffered => 2,
            FamilyKind::Plain | FamilyKind::ReductionOnly => 1,
        }
    }

    /// Whether elements of such a buffer may be swapped or reordered.
    pub const fn is_reorderable(self) -> bool {
        !matches!(self, FamilyKind::ReductionOnly)
    }
}

/// Compile-time buffer family.
pub trait Family: 'static {
    /// Runtime tag.
    const KIND: FamilyKind;
    /// Number of arrays.
    const ARRAYS: usize = Self::KIND.arrays();
}

/// Families whose elements can be swapped and reordered.
pub trait Reorderable: Family {}

/// Single array.
#[derive(Debug)]
pub enum Plain {}
/// Read and write generations.
#[derive(Debug)]
pub enum DoubleBuffered {}
/// Reduction scratch space.
#[derive(Debug)]
pub enum ReductionOnly {}

impl Family for Plain {
    const KIND: FamilyKind = FamilyKind::Plain;
}
impl Family for DoubleBuffered {
    const KIND: FamilyKind = FamilyKind::DoubleBuffered;
}
impl Family for ReductionOnly {
    const KIND: FamilyKind = FamilyKind::ReductionOnly;
}

impl Reorderable for Plain {}
impl Reorderable for DoubleBuffered {}

/// A per-particle quantity: the static binding of key, element type and family.
pub trait Quantity: 'static {
    /// Element type of every array of the buffer.
    type Element: Pod + Send + Sync;
    /// Buffer family.
    type Family: Family;
    /// Single-bit key.
    const KEY: BufferKey;
    /// Human-readable name.
    const NAME: &'static str;
}

/// Static description of a quantity, for type-erased code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityInfo {
    /// Single-bit key.
    pub key: BufferKey,
    /// Human-readable name.
    pub name: &'static str,
    /// Size in bytes of one element.
    pub element_size: usize,
    /// Buffer family.
    pub family: FamilyKind,
}

impl QuantityInfo {
    /// Find the description of a single-bit key.
    pub fn lookup(key: BufferKey) -> Option<&'static QuantityInfo> {
        CATALOGUE.iter().find(|info| info.key == key)
    }
}

macro_rules! quantities {
    ($(
        $(#[$meta:meta])*
        $ty:ident => $key:ident, $elem:ty, $family:ty, $name:literal;
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $ty {}

            impl Quantity for $ty {
                type Element = $elem;
                type Family = $family;
                const KEY: BufferKey = BufferKey::$key;
                const NAME: &'static str = $name;
            }
        )*

        /// Every known quantity, in key order.
        pub const CATALOGUE: &[QuantityInfo] = &[
            $(
                QuantityInfo {
                    key: BufferKey::$key,
                    name: $name,
                    element_size: std::mem::size_of::<$elem>(),
                    family: <$family as Family>::KIND,
                },
            )*
        ];
    };
}

quantities! {
    /// Positions in double precision.
    PosDouble => POS_DOUBLE, Double4, Plain, "Position (double precision)";
    /// Positions and masses.
    Pos => POS, Float4, DoubleBuffered, "Position";
    /// Cell hashes.
    Hash => HASH, HashKey, Plain, "Hash";
    /// Pre-sort particle indices.
    PartIndex => PART_INDEX, u32, Plain, "Particle Index";
    /// Cell start offsets.
    CellStart => CELL_START, u32, Plain, "Cell Start";
    /// Cell end offsets.
    CellEnd => CELL_END, u32, Plain, "Cell End";
    /// Neighbor lists.
    NeibsList => NEIBS_LIST, NeibData, Plain, "Neighbor List";
    /// Forces.
    Forces => FORCES, Float4, Plain, "Force";
    /// XSPH corrections.
    Xsph => XSPH, Float4, Plain, "XSPH";
    /// Velocities and densities.
    Vel => VEL, Float4, DoubleBuffered, "Velocity";
    /// Particle info.
    Info => INFO, ParticleInfo, DoubleBuffered, "Info";
    /// Boundary elements.
    BoundElements => BOUND_ELEMENTS, Float4, DoubleBuffered, "Boundary Elements";
    /// Gamma gradient.
    GradGamma => GRAD_GAMMA, Float4, DoubleBuffered, "Gamma Gradient";
    /// Boundary vertices.
    Vertices => VERTICES, VertexInfo, DoubleBuffered, "Vertices";
    /// Pressure.
    Pressure => PRESSURE, f32, DoubleBuffered, "Pressure";
    /// Turbulent kinetic energy.
    Tke => TKE, f32, DoubleBuffered, "Turbulent Kinetic Energy";
    /// Turbulent dissipation.
    Epsilon => EPSILON, f32, DoubleBuffered, "Turbulent Dissipation Rate";
    /// Turbulent viscosity.
    TurbVisc => TURB_VISC, f32, DoubleBuffered, "Eddy Viscosity";
    /// Strain rate.
    StrainRate => STRAIN_RATE, f32, DoubleBuffered, "Strain Rate";
    /// Vorticity.
    Vorticity => VORTICITY, Float3, Plain, "Vorticity";
    /// Surface normals.
    Normals => NORMALS, Float4, Plain, "Normals";
    /// SPS stress.
    Tau => TAU, Float2, Plain, "Tau";
    /// CFL partial maxima.
    Cfl => CFL, f32, ReductionOnly, "CFL";
    /// CFL scratch.
    CflTemp => CFL_TEMP, f32, ReductionOnly, "CFL Temp";
}
