//! Neighborhood graph over grid positions.
//!
//! Every node is linked to its `k` nearest other nodes by Euclidean
//! distance between integer `(row, col)` coordinates, then the directed
//! kNN relation is symmetrized: if either endpoint selected the other, the
//! edge exists in both directions. Self-loops are never added.
//!
//! Because symmetrization is one-sided kNN plus its mirror, a node may end
//! up with more than `k` neighbors (interior nodes picked by border nodes).
//! This degree inflation is part of the graph definition and is kept.
//!
//! The graph depends on `(height, width)` alone, so it is exposed through
//! the [`NeighborhoodGraph`] provider trait:
//! - [`KnnGridGraph`]: rebuilds the matrix on every request
//! - [`CachedKnnGridGraph`]: memoizes the matrix per grid shape and its
//!   dense tensor per device

use std::sync::Arc;

use candle_core::{Device, DeviceLocation, Tensor};
use moka::sync::Cache;
use tracing::debug;

use crate::error::Result;
use crate::grid::GridShape;

/// Number of neighbors each node selects before symmetrization.
pub const DEFAULT_NEIGHBORS: usize = 4;

/// Distinct grid shapes kept by [`CachedKnnGridGraph`].
const DEFAULT_CACHE_CAPACITY: u64 = 16;

// ============================================================================
// Dense adjacency
// ============================================================================

/// Dense, symmetric, binary `n × n` adjacency matrix (`n = height * width`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyMatrix {
    grid: GridShape,
    n: usize,
    data: Vec<u8>,
}

impl AdjacencyMatrix {
    fn empty(grid: GridShape) -> Self {
        let n = grid.num_nodes();
        Self {
            grid,
            n,
            data: vec![0; n * n],
        }
    }

    fn link(&mut self, i: usize, j: usize) {
        self.data[i * self.n + j] = 1;
        self.data[j * self.n + i] = 1;
    }

    pub fn grid(&self) -> GridShape {
        self.grid
    }

    /// Number of nodes (matrix side).
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Whether nodes `i` and `j` are connected.
    pub fn get(&self, i: usize, j: usize) -> bool {
        self.data[i * self.n + j] == 1
    }

    /// Number of neighbors of node `i` after symmetrization.
    pub fn degree(&self, i: usize) -> usize {
        self.data[i * self.n..(i + 1) * self.n]
            .iter()
            .map(|&v| v as usize)
            .sum()
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.data.iter().map(|&v| v as usize).sum::<usize>() / 2
    }

    pub fn is_symmetric(&self) -> bool {
        (0..self.n).all(|i| (i + 1..self.n).all(|j| self.get(i, j) == self.get(j, i)))
    }

    /// Materialize as an `f32` tensor of shape `(n, n)` on `device`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = self.data.iter().map(|&v| v as f32).collect();
        Ok(Tensor::from_vec(values, (self.n, self.n), device)?)
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Directed kNN lists: for every node (row-major), its `k` nearest other
/// nodes ordered by increasing distance.
///
/// Rows are sorted with a stable sort on squared integer distance, so ties
/// keep row-major order. Position 0 of each sorted row is the node itself
/// (the only zero distance) and is skipped. Grids with fewer than `k + 1`
/// nodes yield shorter lists; a 1×1 grid yields one empty list.
pub fn nearest_neighbors(grid: GridShape, k: usize) -> Vec<Vec<usize>> {
    let coords: Vec<(i64, i64)> = grid
        .positions()
        .map(|(r, c)| (r as i64, c as i64))
        .collect();

    coords
        .iter()
        .map(|&(ri, ci)| {
            let mut order: Vec<(i64, usize)> = coords
                .iter()
                .enumerate()
                .map(|(j, &(rj, cj))| ((ri - rj).pow(2) + (ci - cj).pow(2), j))
                .collect();
            order.sort_by_key(|&(dist, _)| dist);
            order.into_iter().skip(1).take(k).map(|(_, j)| j).collect()
        })
        .collect()
}

/// Build the symmetric kNN adjacency with `k` neighbors per node.
pub fn build_knn_adjacency(grid: GridShape, k: usize) -> AdjacencyMatrix {
    let mut adj = AdjacencyMatrix::empty(grid);
    for (i, neighbors) in nearest_neighbors(grid, k).into_iter().enumerate() {
        for j in neighbors {
            adj.link(i, j);
        }
    }
    adj
}

/// Build the symmetric 4-nearest-neighbor adjacency for `grid`.
pub fn build_adjacency(grid: GridShape) -> AdjacencyMatrix {
    build_knn_adjacency(grid, DEFAULT_NEIGHBORS)
}

// ============================================================================
// Providers
// ============================================================================

/// Source of the adjacency matrix used by graph convolution layers.
///
/// Implementations must return the same matrix for the same grid shape;
/// they differ only in how much work they repeat.
pub trait NeighborhoodGraph: Send + Sync {
    /// Adjacency matrix for `grid`.
    fn matrix(&self, grid: GridShape) -> Arc<AdjacencyMatrix>;

    /// Adjacency matrix for `grid` as a dense `(n, n)` tensor on `device`.
    fn adjacency(&self, grid: GridShape, device: &Device) -> Result<Tensor> {
        self.matrix(grid).to_tensor(device)
    }
}

/// Rebuilds the kNN adjacency on every call.
#[derive(Debug, Clone)]
pub struct KnnGridGraph {
    k: usize,
}

impl KnnGridGraph {
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Default for KnnGridGraph {
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBORS)
    }
}

impl NeighborhoodGraph for KnnGridGraph {
    fn matrix(&self, grid: GridShape) -> Arc<AdjacencyMatrix> {
        Arc::new(build_knn_adjacency(grid, self.k))
    }
}

/// kNN adjacency memoized per grid shape.
///
/// The dense tensor handed to the layers is memoized as well, keyed by grid
/// shape and device, so repeated forwards reuse one device buffer.
/// Thread-safe; clones share the same caches.
#[derive(Clone)]
pub struct CachedKnnGridGraph {
    k: usize,
    cache: Cache<GridShape, Arc<AdjacencyMatrix>>,
    tensors: Cache<(GridShape, DeviceLocation), Tensor>,
}

impl CachedKnnGridGraph {
    pub fn new(k: usize) -> Self {
        Self::with_capacity(k, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(k: usize, capacity: u64) -> Self {
        Self {
            k,
            cache: Cache::new(capacity),
            tensors: Cache::new(capacity),
        }
    }

    /// Number of grid shapes currently cached.
    pub fn cached_shapes(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Number of `(grid shape, device)` tensors currently cached.
    pub fn cached_tensors(&self) -> u64 {
        self.tensors.run_pending_tasks();
        self.tensors.entry_count()
    }
}

impl Default for CachedKnnGridGraph {
    fn default() -> Self {
        Self::new(DEFAULT_NEIGHBORS)
    }
}

impl NeighborhoodGraph for CachedKnnGridGraph {
    fn matrix(&self, grid: GridShape) -> Arc<AdjacencyMatrix> {
        self.cache.get_with(grid, || {
            debug!(%grid, k = self.k, "adjacency cache miss");
            Arc::new(build_knn_adjacency(grid, self.k))
        })
    }

    fn adjacency(&self, grid: GridShape, device: &Device) -> Result<Tensor> {
        let key = (grid, device.location());
        if let Some(tensor) = self.tensors.get(&key) {
            return Ok(tensor);
        }
        let tensor = self.matrix(grid).to_tensor(device)?;
        self.tensors.insert(key, tensor.clone());
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_with_zero_diagonal() {
        for (h, w) in [(2, 2), (3, 3), (4, 7), (9, 9), (5, 2)] {
            let adj = build_adjacency(GridShape::new(h, w));
            assert!(adj.is_symmetric(), "{h}x{w} not symmetric");
            for i in 0..adj.len() {
                assert!(!adj.get(i, i), "{h}x{w} has self-loop at {i}");
            }
        }
    }

    #[test]
    fn test_out_degree_and_symmetrized_degree() {
        for (h, w) in [(1, 3), (2, 2), (3, 3), (6, 4), (9, 9)] {
            let grid = GridShape::new(h, w);
            let n = grid.num_nodes();
            let expected = DEFAULT_NEIGHBORS.min(n - 1);

            for neighbors in nearest_neighbors(grid, DEFAULT_NEIGHBORS) {
                assert_eq!(neighbors.len(), expected);
            }

            let adj = build_adjacency(grid);
            for i in 0..n {
                assert!(adj.degree(i) >= expected, "{h}x{w} node {i}");
            }
        }
    }

    #[test]
    fn test_single_node_grid_is_zero_matrix() {
        let grid = GridShape::new(1, 1);
        assert_eq!(nearest_neighbors(grid, 4), vec![Vec::<usize>::new()]);

        let adj = build_adjacency(grid);
        assert_eq!(adj.len(), 1);
        assert!(!adj.get(0, 0));
        assert_eq!(adj.edge_count(), 0);
    }

    #[test]
    fn test_ties_follow_row_major_order() {
        // Corner (0,0) of a 3x3 grid: distance-1 nodes are 1 and 3,
        // then the diagonal 4 (sqrt 2), then the distance-2 nodes 2 and 6.
        let lists = nearest_neighbors(GridShape::square(3), 4);
        assert_eq!(lists[0], vec![1, 3, 4, 2]);
        // Center sees its four axis neighbors in row-major order.
        assert_eq!(lists[4], vec![1, 3, 5, 7]);
    }

    #[test]
    fn test_degree_can_exceed_k() {
        // Corners pick the center-adjacent diagonal, so interior nodes of a
        // 3x3 grid gain extra neighbors after symmetrization.
        let adj = build_adjacency(GridShape::square(3));
        let max_degree = (0..adj.len()).map(|i| adj.degree(i)).max().unwrap();
        assert!(max_degree > DEFAULT_NEIGHBORS);
        assert!(adj.get(0, 4) && adj.get(4, 0));
    }

    #[test]
    fn test_to_tensor_matches_matrix() {
        let adj = build_adjacency(GridShape::new(2, 3));
        let t = adj.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[6, 6]);

        let rows = t.to_vec2::<f32>().unwrap();
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v == 1.0, adj.get(i, j));
            }
        }
    }

    #[test]
    fn test_cached_provider_matches_fresh() {
        let fresh = KnnGridGraph::default();
        let cached = CachedKnnGridGraph::default();

        for grid in [GridShape::square(5), GridShape::new(3, 8), GridShape::square(5)] {
            assert_eq!(*fresh.matrix(grid), *cached.matrix(grid));
        }
        assert_eq!(cached.cached_shapes(), 2);

        let first = cached.matrix(GridShape::square(5));
        let second = cached.matrix(GridShape::square(5));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cached_provider_reuses_device_tensor() {
        let cached = CachedKnnGridGraph::default();
        let grid = GridShape::new(4, 6);

        let first = cached.adjacency(grid, &Device::Cpu).unwrap();
        let second = cached.adjacency(grid, &Device::Cpu).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(cached.cached_tensors(), 1);

        let fresh = KnnGridGraph::default().adjacency(grid, &Device::Cpu).unwrap();
        assert_eq!(first.to_vec2::<f32>().unwrap(), fresh.to_vec2::<f32>().unwrap());
    }
}
