//! Dense grid prefix: the first `D` levels of the octree are a complete
//! 8-ary tree laid out level by level, so the `8^D` cells at depth `D` can
//! be addressed directly from a particle's position.

use nalgebra::Vector3;

use crate::{
    bounding_box::BoundingBox,
    shared::{Float, lit},
};

/// First pool index of prefix level `level`: `(8^level - 1) / 7`.
#[inline]
pub const fn level_offset(level: u32) -> usize {
    ((1usize << (3 * level)) - 1) / 7
}

/// Number of nodes in a complete prefix of depth `depth`.
#[inline]
pub const fn prefix_len(depth: u32) -> usize {
    level_offset(depth + 1)
}

#[inline]
pub const fn cell_count(depth: u32) -> usize {
    1 << (3 * depth)
}

/// Children of the prefix node sitting at `index` (level-local) on `level`.
#[inline]
pub fn prefix_children(level: u32, index: usize) -> [u32; 8] {
    let first = level_offset(level + 1) + 8 * index;
    std::array::from_fn(|k| (first + k) as u32)
}

/// Grid coordinate of a depth-`depth` cell. Base-8 digit `d` of `cell`
/// holds bit `d` of each axis: bit0 of the digit is x, bit1 y, bit2 z.
pub fn cell_coords(cell: u32, depth: u32) -> [u32; 3] {
    let mut ijk = [0u32; 3];
    for d in 0..depth {
        let digit = (cell >> (3 * d)) & 7;
        for (axis, c) in ijk.iter_mut().enumerate() {
            *c |= ((digit >> axis) & 1) << d;
        }
    }
    ijk
}

/// Inverse of [`cell_coords`].
pub fn cell_index(ijk: [u32; 3], depth: u32) -> u32 {
    let mut cell = 0u32;
    for d in 0..depth {
        let digit = (0..3).fold(0u32, |acc, axis| acc | ((ijk[axis] >> d) & 1) << axis);
        cell |= digit << (3 * d);
    }
    cell
}

/// Per-step geometry of the depth-`D` cells.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Grid<F: Float> {
    pub min: Vector3<F>,
    pub max: Vector3<F>,
    pub cell_size: Vector3<F>,
    pub depth: u32,
}

impl<F: Float> Grid<F> {
    pub fn new(bbox: &BoundingBox<F>, depth: u32) -> Self {
        let per_axis = lit::<F>((1u64 << depth) as f64);
        Self {
            min: bbox.min,
            max: bbox.max,
            cell_size: bbox.size() / per_axis,
            depth,
        }
    }

    #[inline]
    pub fn cells_per_axis(&self) -> u32 {
        1 << self.depth
    }

    pub fn cell_center(&self, cell: u32) -> Vector3<F> {
        let ijk = cell_coords(cell, self.depth);
        let half = lit::<F>(0.5);
        Vector3::from_fn(|axis, _| {
            self.min[axis] + (lit::<F>(ijk[axis] as f64) + half) * self.cell_size[axis]
        })
    }

    /// Lower edge of cell `i` along `axis`; the edge past the last cell is `max`.
    #[inline]
    fn edge(&self, axis: usize, i: u32) -> F {
        if i >= self.cells_per_axis() {
            return self.max[axis];
        }
        self.min[axis] + lit::<F>(i as f64) * self.cell_size[axis]
    }

    /// Half-open box `[edge(ijk), edge(ijk + 1))` of a cell. [`Grid::cell_of`]
    /// bins against the same edges, so a binned particle is always inside.
    pub fn cell_bounds(&self, cell: u32) -> BoundingBox<F> {
        let ijk = cell_coords(cell, self.depth);
        BoundingBox::new(
            Vector3::from_fn(|axis, _| self.edge(axis, ijk[axis])),
            Vector3::from_fn(|axis, _| self.edge(axis, ijk[axis] + 1)),
        )
    }

    /// Cell owning `p`: `floor((p - min) / cell_size)` clamped to the grid,
    /// nudged by one when rounding put `p` across a cell edge.
    pub fn cell_of(&self, p: &Vector3<F>) -> u32 {
        let last = self.cells_per_axis() - 1;
        let ijk: [u32; 3] = std::array::from_fn(|axis| {
            let t = ((p[axis] - self.min[axis]) / self.cell_size[axis]).floor();
            let i = num_traits::cast::<F, i64>(t)
                .unwrap_or(0)
                .clamp(0, last as i64) as u32;
            if i > 0 && p[axis] < self.edge(axis, i) {
                i - 1
            } else if i < last && p[axis] >= self.edge(axis, i + 1) {
                i + 1
            } else {
                i
            }
        });
        cell_index(ijk, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::AABB;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn offsets_and_lengths() {
        assert_eq!(level_offset(0), 0);
        assert_eq!(level_offset(1), 1);
        assert_eq!(level_offset(2), 9);
        assert_eq!(level_offset(3), 73);
        assert_eq!(prefix_len(0), 1);
        assert_eq!(prefix_len(2), 73);
        assert_eq!(prefix_len(5), 37449);
        assert_eq!(cell_count(5), 32768);
    }

    #[test]
    fn children_follow_the_parent() {
        assert_eq!(prefix_children(0, 0), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(prefix_children(1, 2)[0], 9 + 16);
    }

    #[test]
    fn coords_roundtrip_and_digit_order() {
        // Digit 0 is the finest level: cell 1 is one step along x.
        assert_eq!(cell_coords(1, 2), [1, 0, 0]);
        assert_eq!(cell_coords(2, 2), [0, 1, 0]);
        assert_eq!(cell_coords(4, 2), [0, 0, 1]);
        assert_eq!(cell_coords(8, 2), [2, 0, 0]);
        for cell in 0..cell_count(3) as u32 {
            assert_eq!(cell_index(cell_coords(cell, 3), 3), cell);
        }
    }

    #[test]
    fn binning_matches_cell_geometry() {
        let bbox = BoundingBox::new(Vector3::new(-1.0, -2.0, 0.0), Vector3::new(1.0, 2.0, 8.0));
        let grid = Grid::<f64>::new(&bbox, 2);
        for cell in 0..cell_count(2) as u32 {
            assert_eq!(grid.cell_of(&grid.cell_center(cell)), cell);
        }
        assert_eq!(grid.cell_of(&Vector3::new(-5.0, -5.0, -5.0)), 0);
        assert_eq!(grid.cell_of(&Vector3::new(5.0, 5.0, 50.0)), 63);
    }

    #[test]
    fn binned_points_lie_in_their_cell_box() {
        let bbox = BoundingBox::new(
            Vector3::new(-0.731_f32, -1.093, -0.377),
            Vector3::new(0.919, 1.201, 2.113),
        );
        let grid = Grid::new(&bbox, 5);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200_000 {
            let p = Vector3::from_fn(|axis, _| rng.random_range(bbox.min[axis]..bbox.max[axis]));
            assert!(grid.cell_bounds(grid.cell_of(&p)).contains(&p), "{p:?}");
        }
        // Points exactly on inner edges belong to the upper cell.
        for i in 1..grid.cells_per_axis() {
            let p = Vector3::new(grid.edge(0, i), bbox.min.y, bbox.min.z);
            let cell = grid.cell_of(&p);
            assert_eq!(cell_coords(cell, 5)[0], i);
            assert!(grid.cell_bounds(cell).contains(&p));
        }
    }
}
