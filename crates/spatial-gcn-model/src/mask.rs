//! Circular pooling mask over the output grid.
//!
//! A disk of radius `r` is inscribed in a square grid of side
//! `2 * ceil(r) + 1`; a cell is selected when its center lies within `r`
//! of the center cell. Predictions on selected cells are averaged to obtain
//! the per-sample aggregate compared against the target mean.

use candle_core::{Device, Tensor};

use crate::error::{GcnError, Result};
use crate::grid::GridShape;

/// Radius used for spot-level pooling.
pub const DEFAULT_MASK_RADIUS: f64 = 55.0 / 16.0;

/// Immutable square boolean mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskMask {
    side: usize,
    cells: Vec<bool>,
}

/// Build the disk mask for `radius`.
pub fn build_disk_mask(radius: f64) -> Result<DiskMask> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(GcnError::InvalidConfig(format!(
            "disk mask radius must be positive and finite, got {radius}"
        )));
    }
    let half = radius.ceil() as usize;
    let side = 2 * half + 1;
    let center = half as f64;

    let cells = GridShape::square(side)
        .positions()
        .map(|(r, c)| {
            let (dr, dc) = (r as f64 - center, c as f64 - center);
            (dr * dr + dc * dc).sqrt() <= radius
        })
        .collect();
    Ok(DiskMask { side, cells })
}

impl DiskMask {
    /// Side length of the square grid.
    pub fn side(&self) -> usize {
        self.side
    }

    pub fn grid(&self) -> GridShape {
        GridShape::square(self.side)
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.cells[row * self.side + col]
    }

    /// Number of selected cells.
    pub fn count(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Row-major indices of selected cells, in ascending order.
    pub fn selected_indices(&self) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(i, &c)| c.then_some(i))
            .collect()
    }

    /// Selected indices as a `u32` tensor, ready for `index_select`.
    pub fn index_tensor(&self, device: &Device) -> Result<Tensor> {
        let ids: Vec<u32> = self.selected_indices().into_iter().map(|i| i as u32).collect();
        let len = ids.len();
        Ok(Tensor::from_vec(ids, len, device)?)
    }

    /// Mask as a `u8` tensor of shape `(side, side)`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<u8> = self.cells.iter().map(|&c| c as u8).collect();
        Ok(Tensor::from_vec(values, (self.side, self.side), device)?)
    }
}

impl std::fmt::Display for DiskMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for row in self.cells.chunks(self.side) {
            let line: String = row.iter().map(|&c| if c { '#' } else { '.' }).collect();
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mask_geometry() {
        let mask = build_disk_mask(DEFAULT_MASK_RADIUS).unwrap();
        assert_eq!(mask.side(), 9);
        assert!(mask.get(4, 4));
        for (r, c) in [(0, 0), (0, 8), (8, 0), (8, 8)] {
            assert!(!mask.get(r, c), "corner ({r}, {c}) selected");
        }
        // Axis extremes are 4 cells away, beyond 3.4375.
        assert!(!mask.get(0, 4));
        assert!(mask.get(1, 4));
        assert_eq!(mask.count(), mask.selected_indices().len());
    }

    #[test]
    fn test_center_always_selected() {
        for radius in [0.3, 1.0, 2.5, 7.0] {
            let mask = build_disk_mask(radius).unwrap();
            let half = mask.side() / 2;
            assert!(mask.get(half, half));
            let half_diagonal = (2.0_f64).sqrt() * half as f64;
            if radius < half_diagonal {
                assert!(!mask.get(0, 0));
                assert!(!mask.get(mask.side() - 1, mask.side() - 1));
            }
        }
    }

    #[test]
    fn test_mask_is_symmetric() {
        let mask = build_disk_mask(4.2).unwrap();
        let n = mask.side();
        for r in 0..n {
            for c in 0..n {
                assert_eq!(mask.get(r, c), mask.get(c, r));
                assert_eq!(mask.get(r, c), mask.get(n - 1 - r, c));
            }
        }
    }

    #[test]
    fn test_invalid_radius() {
        assert!(build_disk_mask(0.0).is_err());
        assert!(build_disk_mask(-1.0).is_err());
        assert!(build_disk_mask(f64::NAN).is_err());
    }

    #[test]
    fn test_tensors() {
        let mask = build_disk_mask(1.0).unwrap();
        assert_eq!(mask.selected_indices(), vec![1, 3, 4, 5, 7]);

        let t = mask.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 3]);
        let idx = mask.index_tensor(&Device::Cpu).unwrap();
        assert_eq!(idx.to_vec1::<u32>().unwrap(), vec![1, 3, 4, 5, 7]);
        assert_eq!(mask.to_string(), ".#.\n###\n.#.\n");
    }
}
