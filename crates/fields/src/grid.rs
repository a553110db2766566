//! Uniform-grid decomposition of the simulation world.
//!
//! The grid is the unit of domain decomposition: each cell is owned by one
//! device, and a particle belongs to the device owning its cell. Cells are
//! linearized x-fastest: `hash = (z * size_y + y) * size_x + x`.

use crate::error::GridError;

/// Geometry of the uniform grid covering the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridDecomposition {
    world_origin: [f32; 3],
    world_size: [f32; 3],
    cell_size: [f32; 3],
    grid_size: [u32; 3],
}

impl GridDecomposition {
    /// Build the grid covering `[world_origin, world_origin + world_size]`
    /// with cells of (at least) `cell_size`.
    ///
    /// The number of cells per axis is `ceil(world_size / cell_size)`, and the
    /// cell size is then stretched so the cells tile the world exactly.
    pub fn new(
        world_origin: [f32; 3],
        world_size: [f32; 3],
        cell_size: [f32; 3],
    ) -> Result<Self, GridError> {
        if world_size.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GridError::InvalidWorldSize(world_size));
        }
        if cell_size.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GridError::InvalidCellSize(cell_size));
        }
        let mut grid_size = [0u32; 3];
        let mut actual_cell = [0f32; 3];
        for axis in 0..3 {
            let cells = (world_size[axis] / cell_size[axis]).ceil().max(1.0);
            if cells > u32::MAX as f32 {
                return Err(GridError::TooManyCells([u32::MAX; 3]));
            }
            grid_size[axis] = cells as u32;
            actual_cell[axis] = world_size[axis] / cells;
        }
        Self::check_cell_count(grid_size)?;
        Ok(Self {
            world_origin,
            world_size,
            cell_size: actual_cell,
            grid_size,
        })
    }

    /// Build a grid from an explicit cell size and cell count.
    ///
    /// The world size is derived as `cell_size * grid_size`.
    pub fn from_cells(
        world_origin: [f32; 3],
        cell_size: [f32; 3],
        grid_size: [u32; 3],
    ) -> Result<Self, GridError> {
        if cell_size.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GridError::InvalidCellSize(cell_size));
        }
        Self::check_cell_count(grid_size)?;
        let world_size = [
            cell_size[0] * grid_size[0] as f32,
            cell_size[1] * grid_size[1] as f32,
            cell_size[2] * grid_size[2] as f32,
        ];
        Ok(Self {
            world_origin,
            world_size,
            cell_size,
            grid_size,
        })
    }

    fn check_cell_count(grid_size: [u32; 3]) -> Result<(), GridError> {
        if grid_size.contains(&0) {
            return Err(GridError::EmptyGrid(grid_size));
        }
        let cells = grid_size.iter().map(|&n| n as u64).product::<u64>();
        if cells > u32::MAX as u64 || grid_size.iter().any(|&n| n > i32::MAX as u32) {
            return Err(GridError::TooManyCells(grid_size));
        }
        Ok(())
    }

    /// Minimum corner of the world.
    pub fn world_origin(&self) -> [f32; 3] {
        self.world_origin
    }

    /// Extent of the world.
    pub fn world_size(&self) -> [f32; 3] {
        self.world_size
    }

    /// Extent of one cell.
    pub fn cell_size(&self) -> [f32; 3] {
        self.cell_size
    }

    /// Number of cells per axis.
    pub fn grid_size(&self) -> [u32; 3] {
        self.grid_size
    }

    /// Total number of cells.
    pub fn n_grid_cells(&self) -> usize {
        self.grid_size.iter().map(|&n| n as usize).product()
    }

    /// Whether `cell_size * grid_size` covers the world on every axis.
    pub fn covers_world(&self) -> bool {
        (0..3).all(|axis| {
            let covered = self.cell_size[axis] * self.grid_size[axis] as f32;
            covered >= self.world_size[axis] * (1.0 - f32::EPSILON * 4.0)
        })
    }

    /// Cell containing `pos`, not clamped: positions outside the world give
    /// coordinates outside `[0, grid_size)`.
    #[inline]
    pub fn cell_of(&self, pos: [f32; 3]) -> [i32; 3] {
        [
            ((pos[0] - self.world_origin[0]) / self.cell_size[0]).floor() as i32,
            ((pos[1] - self.world_origin[1]) / self.cell_size[1]).floor() as i32,
            ((pos[2] - self.world_origin[2]) / self.cell_size[2]).floor() as i32,
        ]
    }

    /// Clamp a cell coordinate into `[0, grid_size - 1]` on every axis.
    #[inline]
    pub fn clamp_cell(&self, cell: [i32; 3]) -> [u32; 3] {
        let clamp = |c: i32, n: u32| c.clamp(0, n as i32 - 1) as u32;
        [
            clamp(cell[0], self.grid_size[0]),
            clamp(cell[1], self.grid_size[1]),
            clamp(cell[2], self.grid_size[2]),
        ]
    }

    /// Linear hash of `cell` after clamping it into the grid.
    ///
    /// Cells outside the grid (particles that overshot the domain) hash to
    /// the nearest boundary cell, never out of range.
    #[inline]
    pub fn linear_hash(&self, cell: [i32; 3]) -> u32 {
        let [x, y, z] = self.clamp_cell(cell);
        (z * self.grid_size[1] + y) * self.grid_size[0] + x
    }

    /// Linear hash of an in-range cell, without clamping.
    ///
    /// The result is only meaningful for cells inside the grid.
    #[inline]
    pub fn linearize(&self, cell: [u32; 3]) -> u32 {
        debug_assert!(
            (0..3).all(|axis| cell[axis] < self.grid_size[axis]),
            "cell {cell:?} outside grid {:?}",
            self.grid_size
        );
        (cell[2] * self.grid_size[1] + cell[1]) * self.grid_size[0] + cell[0]
    }

    /// Cell coordinates of a linear hash; exact inverse of [`linearize`](Self::linearize).
    #[inline]
    pub fn unlinearize(&self, hash: u32) -> [u32; 3] {
        let layer = self.grid_size[0] * self.grid_size[1];
        let z = hash / layer;
        let rem = hash - z * layer;
        let y = rem / self.grid_size[0];
        let x = rem - y * self.grid_size[0];
        [x, y, z]
    }

    /// Clamped linear hash of the cell containing `pos`.
    #[inline]
    pub fn hash_of(&self, pos: [f32; 3]) -> u32 {
        self.linear_hash(self.cell_of(pos))
    }

    /// World-space center of a cell.
    pub fn cell_center(&self, cell: [u32; 3]) -> [f32; 3] {
        let mut center = [0.0; 3];
        for axis in 0..3 {
            center[axis] =
                self.world_origin[axis] + (cell[axis] as f32 + 0.5) * self.cell_size[axis];
        }
        center
    }
}
