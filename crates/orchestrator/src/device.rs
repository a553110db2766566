//! Device identifiers, node topology and the cell-to-device map.

use std::fmt;

use fields::GridDecomposition;

use crate::error::StateError;

/// Bits of a global device id reserved for the local device index.
pub const DEVICE_BITS: u32 = 3;
/// Mask extracting the local device index from a global device id.
pub const DEVICE_MASK: u8 = (1 << DEVICE_BITS) - 1;
/// Largest number of devices a single node can drive.
pub const MAX_DEVICES_PER_NODE: usize = 1 << DEVICE_BITS;
/// Largest number of nodes a global device id can address.
pub const MAX_NODES: usize = 1 << (u8::BITS - DEVICE_BITS);

/// Composite device id: `rank << DEVICE_BITS | local device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GlobalDeviceId(u8);

impl GlobalDeviceId {
    /// Id of local device `device` on node `rank`.
    ///
    /// `rank` must be below [`MAX_NODES`] and `device` below
    /// [`MAX_DEVICES_PER_NODE`], as [`Topology::new`] guarantees for ids it
    /// hands out. Debug builds panic on anything else.
    pub fn new(rank: usize, device: usize) -> Self {
        debug_assert!(rank < MAX_NODES, "rank {rank} does not fit a device id");
        debug_assert!(
            device < MAX_DEVICES_PER_NODE,
            "device {device} does not fit a device id"
        );
        Self(((rank as u8) << DEVICE_BITS) | (device as u8 & DEVICE_MASK))
    }

    /// Reinterpret a raw device-map byte.
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw byte.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Node rank.
    pub fn rank(self) -> usize {
        (self.0 >> DEVICE_BITS) as usize
    }

    /// Local device index.
    pub fn device(self) -> usize {
        (self.0 & DEVICE_MASK) as usize
    }

    /// Linear device number across the cluster, with `devices_per_node`
    /// devices on every node.
    pub fn global_num(self, devices_per_node: usize) -> usize {
        devices_per_node * self.rank() + self.device()
    }

    /// Inverse of [`global_num`](Self::global_num).
    pub fn from_global_num(num: usize, devices_per_node: usize) -> Self {
        Self::new(num / devices_per_node, num % devices_per_node)
    }
}

impl fmt::Display for GlobalDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rank(), self.device())
    }
}

/// Devices and nodes taking part in the run, seen from one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    devices: usize,
    nodes: usize,
    rank: usize,
}

impl Topology {
    /// Topology with `devices` local devices on each of `nodes` nodes, this
    /// process being node `rank`.
    pub fn new(devices: usize, nodes: usize, rank: usize) -> Result<Self, StateError> {
        let devices_ok = (1..=MAX_DEVICES_PER_NODE).contains(&devices);
        let nodes_ok = (1..=MAX_NODES).contains(&nodes) && rank < nodes;
        if !devices_ok || !nodes_ok {
            return Err(StateError::InvalidTopology {
                devices,
                nodes,
                rank,
            });
        }
        Ok(Self {
            devices,
            nodes,
            rank,
        })
    }

    /// Single device on a single node.
    pub fn single() -> Self {
        Self {
            devices: 1,
            nodes: 1,
            rank: 0,
        }
    }

    /// Local devices on this node.
    pub fn devices(&self) -> usize {
        self.devices
    }

    /// Number of nodes.
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Rank of this node.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Devices across every node.
    pub fn total_devices(&self) -> usize {
        self.devices * self.nodes
    }

    /// More than one node.
    pub fn is_multi_node(&self) -> bool {
        self.nodes > 1
    }

    /// More than one device on this node.
    pub fn is_multi_gpu(&self) -> bool {
        self.devices > 1
    }

    /// More than one device in the whole run.
    pub fn is_multi_device(&self) -> bool {
        self.is_multi_node() || self.is_multi_gpu()
    }

    /// Global id of local device `device` on this node.
    pub fn global_id(&self, device: usize) -> GlobalDeviceId {
        GlobalDeviceId::new(self.rank, device)
    }

    /// Whether `id` names a device of this node.
    pub fn is_local(&self, id: GlobalDeviceId) -> bool {
        id.rank() == self.rank && id.device() < self.devices
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::single()
    }
}

/// Encoding of the values stored in a [`DeviceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEncoding {
    /// Linear device number, `0..total_devices`.
    Linear,
    /// [`GlobalDeviceId`] bytes.
    Global,
}

/// Owning device of every grid cell, one byte per cell in hash order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    cells: Vec<u8>,
    encoding: MapEncoding,
}

impl DeviceMap {
    /// Map from raw global device id bytes.
    pub fn from_global(cells: Vec<u8>) -> Self {
        Self {
            cells,
            encoding: MapEncoding::Global,
        }
    }

    /// Map from linear device numbers, to be converted with
    /// [`convert_to_global`](Self::convert_to_global).
    pub fn from_linear(cells: Vec<u8>) -> Self {
        Self {
            cells,
            encoding: MapEncoding::Linear,
        }
    }

    /// Split the grid into `devices` slabs of consecutive cells along `axis`.
    ///
    /// Values are linear device numbers. Cells are spread as evenly as the
    /// axis allows; with more devices than cells some devices own nothing.
    pub fn slabs(grid: &GridDecomposition, axis: usize, devices: usize) -> Self {
        let size = grid.grid_size();
        let axis = axis.min(2);
        let span = size[axis] as usize;
        let devices = devices.max(1);
        let cells = (0..grid.n_grid_cells() as u32)
            .map(|hash| {
                let coord = grid.unlinearize(hash)[axis] as usize;
                (coord * devices / span) as u8
            })
            .collect();
        tracing::debug!(
            "Split {:?} cells into {} slabs along axis {}",
            size,
            devices,
            axis
        );
        Self::from_linear(cells)
    }

    /// Rewrite linear device numbers as global device ids, with
    /// `devices_per_node` devices on every node. No-op if already global.
    pub fn convert_to_global(&mut self, devices_per_node: usize) {
        if self.encoding == MapEncoding::Global {
            return;
        }
        let per_node = devices_per_node.max(1);
        for cell in &mut self.cells {
            *cell = GlobalDeviceId::from_global_num(*cell as usize, per_node).raw();
        }
        self.encoding = MapEncoding::Global;
    }

    /// Current value encoding.
    pub fn encoding(&self) -> MapEncoding {
        self.encoding
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if the map has no cell.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw value of cell `hash`.
    #[inline]
    pub fn get(&self, hash: u32) -> Option<u8> {
        self.cells.get(hash as usize).copied()
    }

    /// Owner of cell `hash`, for a globally encoded map.
    #[inline]
    pub fn owner(&self, hash: u32) -> Option<GlobalDeviceId> {
        self.get(hash).map(GlobalDeviceId::from_raw)
    }

    /// Raw values in hash order.
    pub fn as_slice(&self) -> &[u8] {
        &self.cells
    }

    /// Number of cells owned by `id`.
    pub fn cells_owned_by(&self, id: GlobalDeviceId) -> usize {
        self.cells.iter().filter(|&&c| c == id.raw()).count()
    }
}

/// Role of a cell from the point of view of one device, stored in the two
/// top bits of a compact map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CellType {
    /// Owned, every neighbor owned too.
    Inner = 0,
    /// Owned, at least one neighbor owned by another device.
    InnerEdge = 1,
    /// Owned by another device, adjacent to an owned cell.
    OuterEdge = 2,
    /// Owned by another device, not adjacent.
    Outer = 3,
}

/// Shift of the cell type inside a compact map entry.
pub const CELLTYPE_SHIFT: u32 = 30;

impl CellType {
    /// Cell type encoded in a compact map entry.
    pub fn from_compact(entry: u32) -> Self {
        match entry >> CELLTYPE_SHIFT {
            0 => CellType::Inner,
            1 => CellType::InnerEdge,
            2 => CellType::OuterEdge,
            _ => CellType::Outer,
        }
    }

    /// Entry bits of this cell type.
    pub fn bits(self) -> u32 {
        (self as u32) << CELLTYPE_SHIFT
    }
}

impl DeviceMap {
    /// Compact map of `owner`: the [`CellType`] of every cell, shifted into
    /// the top two bits.
    ///
    /// Adjacency covers the 26 surrounding cells that lie inside the grid.
    pub fn compact_for(&self, grid: &GridDecomposition, owner: GlobalDeviceId) -> Vec<u32> {
        let size = grid.grid_size();
        let owned = |cell: [u32; 3]| self.owner(grid.linearize(cell)) == Some(owner);
        (0..grid.n_grid_cells() as u32)
            .map(|hash| {
                let cell = grid.unlinearize(hash);
                let mine = owned(cell);
                let mut mixed = false;
                'search: for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let n = [
                                cell[0] as i64 + dx,
                                cell[1] as i64 + dy,
                                cell[2] as i64 + dz,
                            ];
                            let inside = (0..3).all(|a| n[a] >= 0 && n[a] < size[a] as i64);
                            if !inside || (dx, dy, dz) == (0, 0, 0) {
                                continue;
                            }
                            if owned([n[0] as u32, n[1] as u32, n[2] as u32]) != mine {
                                mixed = true;
                                break 'search;
                            }
                        }
                    }
                }
                let kind = match (mine, mixed) {
                    (true, false) => CellType::Inner,
                    (true, true) => CellType::InnerEdge,
                    (false, true) => CellType::OuterEdge,
                    (false, false) => CellType::Outer,
                };
                kind.bits()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_components() {
        let id = GlobalDeviceId::new(2, 3);
        assert_eq!(id.raw(), (2 << 3) | 3);
        assert_eq!(id.rank(), 2);
        assert_eq!(id.device(), 3);
        assert_eq!(id.global_num(4), 11);
        assert_eq!(GlobalDeviceId::from_global_num(11, 4), id);
        assert_eq!(id.to_string(), "2:3");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit a device id")]
    fn oversized_device_is_not_truncated() {
        let _ = GlobalDeviceId::new(0, MAX_DEVICES_PER_NODE);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit a device id")]
    fn oversized_rank_is_not_truncated() {
        let _ = GlobalDeviceId::new(MAX_NODES, 0);
    }

    #[test]
    fn topology_predicates() {
        let single = Topology::single();
        assert!(!single.is_multi_device());
        let gpus = Topology::new(2, 1, 0).unwrap();
        assert!(gpus.is_multi_gpu() && !gpus.is_multi_node() && gpus.is_multi_device());
        let cluster = Topology::new(1, 4, 3).unwrap();
        assert!(cluster.is_multi_node() && !cluster.is_multi_gpu());
        assert_eq!(cluster.total_devices(), 4);
        assert!(cluster.is_local(GlobalDeviceId::new(3, 0)));
        assert!(!cluster.is_local(GlobalDeviceId::new(2, 0)));
    }

    #[test]
    fn topology_rejects_out_of_range() {
        assert!(Topology::new(0, 1, 0).is_err());
        assert!(Topology::new(MAX_DEVICES_PER_NODE + 1, 1, 0).is_err());
        assert!(Topology::new(1, 2, 2).is_err());
        assert!(Topology::new(1, MAX_NODES + 1, 0).is_err());
    }

    #[test]
    fn slabs_split_evenly() {
        let grid = GridDecomposition::from_cells([0.0; 3], [1.0; 3], [4, 2, 1]).unwrap();
        let map = DeviceMap::slabs(&grid, 0, 2);
        assert_eq!(map.as_slice(), &[0, 0, 1, 1, 0, 0, 1, 1]);
        assert_eq!(map.encoding(), MapEncoding::Linear);
    }

    #[test]
    fn convert_linear_to_global() {
        let mut map = DeviceMap::from_linear(vec![0, 1, 2, 3]);
        map.convert_to_global(2);
        assert_eq!(map.encoding(), MapEncoding::Global);
        assert_eq!(map.owner(3), Some(GlobalDeviceId::new(1, 1)));
        assert_eq!(map.owner(2), Some(GlobalDeviceId::new(1, 0)));
        map.convert_to_global(2);
        assert_eq!(map.owner(3), Some(GlobalDeviceId::new(1, 1)));
        assert_eq!(map.cells_owned_by(GlobalDeviceId::new(0, 1)), 1);
        assert_eq!(map.owner(4), None);
    }

    #[test]
    fn compact_map_cell_types() {
        let grid = GridDecomposition::from_cells([0.0; 3], [1.0; 3], [4, 1, 1]).unwrap();
        let mut map = DeviceMap::slabs(&grid, 0, 2);
        map.convert_to_global(2);
        let compact = map.compact_for(&grid, GlobalDeviceId::new(0, 0));
        let kinds: Vec<_> = compact.iter().map(|&e| CellType::from_compact(e)).collect();
        assert_eq!(
            kinds,
            vec![
                CellType::Inner,
                CellType::InnerEdge,
                CellType::OuterEdge,
                CellType::Outer
            ]
        );
        assert_eq!(compact[3] >> 30, 3);
    }
}
