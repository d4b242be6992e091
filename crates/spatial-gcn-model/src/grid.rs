//! Grid geometry shared by the adjacency builder, the layers and the mask.

use serde::{Deserialize, Serialize};

use crate::error::{GcnError, Result};

/// Height and width of a 2D grid of nodes, indexed row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    pub height: usize,
    pub width: usize,
}

impl GridShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn square(side: usize) -> Self {
        Self::new(side, side)
    }

    /// Total number of nodes (`height * width`).
    pub fn num_nodes(&self) -> usize {
        self.height * self.width
    }

    /// Row-major node index of `(row, col)`.
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// `(row, col)` of a row-major node index.
    pub fn position(&self, index: usize) -> (usize, usize) {
        (index / self.width, index % self.width)
    }

    /// All positions in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.height).flat_map(move |row| (0..self.width).map(move |col| (row, col)))
    }

    /// Infer a square grid from a flattened node count.
    ///
    /// Flattened inputs carry no width, so the only recoverable layout is
    /// `sqrt(n) × sqrt(n)`. Anything else is rejected instead of being
    /// aggregated over the wrong neighborhood.
    pub fn infer_square(num_nodes: usize) -> Result<Self> {
        let side = (num_nodes as f64).sqrt().round() as usize;
        if num_nodes == 0 || side * side != num_nodes {
            return Err(GcnError::InvalidGridShape(format!(
                "{num_nodes} nodes cannot be laid out as a square grid; pass an explicit grid shape"
            )));
        }
        Ok(Self::square(side))
    }

    /// Check that a flattened node axis of length `num_nodes` fits this grid.
    pub fn expect_nodes(&self, num_nodes: usize) -> Result<()> {
        if self.num_nodes() != num_nodes {
            return Err(GcnError::InvalidGridShape(format!(
                "grid {}x{} has {} nodes but input has {}",
                self.height,
                self.width,
                self.num_nodes(),
                num_nodes
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for GridShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_indexing() {
        let grid = GridShape::new(2, 3);
        assert_eq!(grid.num_nodes(), 6);
        assert_eq!(grid.index(1, 2), 5);
        assert_eq!(grid.position(4), (1, 1));

        let positions: Vec<_> = grid.positions().collect();
        assert_eq!(positions[0], (0, 0));
        assert_eq!(positions[3], (1, 0));
        assert_eq!(positions.len(), 6);
    }

    #[test]
    fn test_infer_square() {
        assert_eq!(GridShape::infer_square(81).unwrap(), GridShape::square(9));
        assert_eq!(GridShape::infer_square(1).unwrap(), GridShape::square(1));
        assert!(matches!(
            GridShape::infer_square(10),
            Err(GcnError::InvalidGridShape(_))
        ));
        assert!(GridShape::infer_square(0).is_err());
    }

    #[test]
    fn test_expect_nodes() {
        let grid = GridShape::new(3, 4);
        assert!(grid.expect_nodes(12).is_ok());
        assert!(grid.expect_nodes(9).is_err());
    }
}
