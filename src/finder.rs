//! Planar nearest-neighbor search over tangent-plane positions.
//!
//! `StarFinder` bins points into a uniform square grid whose cell size equals
//! the search radius, so a query only has to scan the 3 × 3 block of cells
//! around the query point. Cells map to compact slices of point indices
//! (`cell_offsets` / `indices`), built once up front.

use crate::geom::{Frame, Point};

/// Upper bound on cells per axis; coarser cells only cost extra distance tests.
const MAX_CELLS_PER_AXIS: usize = 2048;

#[derive(Debug, Clone)]
pub struct StarFinder {
    points: Vec<Point>,
    origin: Point,
    cell_size: f64,
    nx: usize,
    ny: usize,
    cell_offsets: Vec<u32>,
    indices: Vec<u32>,
}

impl StarFinder {
    /// Index `points` for queries of radius up to `max_radius`.
    ///
    /// Non-finite points are kept in numbering but never returned.
    pub fn new(points: Vec<Point>, max_radius: f64) -> Self {
        let finite: Vec<Point> = points
            .iter()
            .copied()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .collect();
        let frame = Frame::around(&finite).unwrap_or(Frame::new(0.0, 0.0, 0.0, 0.0));

        let span = frame.width().max(frame.height());
        let mut cell_size = if max_radius > 0.0 && max_radius.is_finite() {
            max_radius
        } else {
            span.max(1.0)
        };
        if span / cell_size > MAX_CELLS_PER_AXIS as f64 {
            cell_size = span / MAX_CELLS_PER_AXIS as f64;
        }
        let nx = ((frame.width() / cell_size).floor() as usize + 1).min(MAX_CELLS_PER_AXIS);
        let ny = ((frame.height() / cell_size).floor() as usize + 1).min(MAX_CELLS_PER_AXIS);
        let origin = Point::new(frame.x_min, frame.y_min);

        let mut bins: Vec<Vec<u32>> = vec![Vec::new(); nx * ny];
        for (idx, p) in points.iter().enumerate() {
            if !(p.x.is_finite() && p.y.is_finite()) {
                continue;
            }
            let (i, j) = Self::cell_of(origin, cell_size, nx, ny, p);
            bins[j * nx + i].push(idx as u32);
        }

        let mut cell_offsets = Vec::with_capacity(nx * ny + 1);
        let mut indices = Vec::with_capacity(points.len());
        cell_offsets.push(0);
        for bin in bins {
            indices.extend(bin);
            cell_offsets.push(indices.len() as u32);
        }

        Self {
            points,
            origin,
            cell_size,
            nx,
            ny,
            cell_offsets,
            indices,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Closest indexed point within `max_dist` of `p`, as `(index, distance)`.
    ///
    /// Equidistant candidates resolve to the lower index.
    pub fn nearest(&self, p: &Point, max_dist: f64) -> Option<(usize, f64)> {
        self.nearest_by(p, max_dist, |idx| self.points[idx].distance(p))
    }

    /// Like [`nearest`](Self::nearest), but candidates within `max_dist` of
    /// `p` in the plane are ranked by `distance(index)` instead, and the
    /// returned distance is that one.
    ///
    /// Equal distances resolve to the lower index; non-finite ones are
    /// dropped.
    pub fn nearest_by(
        &self,
        p: &Point,
        max_dist: f64,
        distance: impl Fn(usize) -> f64,
    ) -> Option<(usize, f64)> {
        if self.points.is_empty() || !(max_dist > 0.0) || !(p.x.is_finite() && p.y.is_finite())
        {
            return None;
        }
        let reach = (max_dist / self.cell_size).ceil() as i64;
        let ci = ((p.x - self.origin.x) / self.cell_size).floor() as i64;
        let cj = ((p.y - self.origin.y) / self.cell_size).floor() as i64;

        let mut best: Option<(usize, f64)> = None;
        for j in (cj - reach).max(0)..=(cj + reach).min(self.ny as i64 - 1) {
            for i in (ci - reach).max(0)..=(ci + reach).min(self.nx as i64 - 1) {
                let cell = j as usize * self.nx + i as usize;
                let start = self.cell_offsets[cell] as usize;
                let end = self.cell_offsets[cell + 1] as usize;
                for &idx in &self.indices[start..end] {
                    let idx = idx as usize;
                    if self.points[idx].distance(p) > max_dist {
                        continue;
                    }
                    let d = distance(idx);
                    if !d.is_finite() {
                        continue;
                    }
                    best = match best {
                        Some((b, bd)) if bd < d || (bd == d && b < idx) => Some((b, bd)),
                        _ => Some((idx, d)),
                    };
                }
            }
        }
        best
    }

    fn cell_of(origin: Point, cell_size: f64, nx: usize, ny: usize, p: &Point) -> (usize, usize) {
        let i = ((p.x - origin.x) / cell_size).floor().max(0.0) as usize;
        let j = ((p.y - origin.y) / cell_size).floor().max(0.0) as usize;
        (i.min(nx - 1), j.min(ny - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_within_radius() {
        let finder = StarFinder::new(
            vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 0.0),
                Point::new(5.0, 5.0),
            ],
            0.6,
        );
        assert_eq!(finder.nearest(&Point::new(0.9, 0.1), 0.6).map(|r| r.0), Some(1));
        assert_eq!(finder.nearest(&Point::new(3.0, 3.0), 0.6), None);
    }

    #[test]
    fn test_tie_goes_to_lower_index() {
        let finder = StarFinder::new(vec![Point::new(1.0, 0.0), Point::new(-1.0, 0.0)], 2.0);
        let (idx, d) = finder.nearest(&Point::new(0.0, 0.0), 2.0).unwrap();
        assert_eq!(idx, 0);
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_matches_brute_force() {
        // Pseudo-random scatter from a fixed LCG
        let mut state = 12345u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        let points: Vec<Point> = (0..500).map(|_| Point::new(next(), next())).collect();
        let finder = StarFinder::new(points.clone(), 0.03);
        for _ in 0..200 {
            let q = Point::new(next(), next());
            let brute = points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, p.distance(&q)))
                .filter(|(_, d)| *d <= 0.03)
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            assert_eq!(finder.nearest(&q, 0.03), brute, "query {q:?}");
        }
    }

    #[test]
    fn test_nearest_by_ranks_with_the_given_distance() {
        let points = vec![Point::new(1.0, 0.0), Point::new(-1.0, 0.0), Point::new(0.0, 1.5)];
        let finder = StarFinder::new(points, 2.0);
        let q = Point::new(0.0, 0.0);
        // Planar tie between 0 and 1; the supplied metric separates them.
        let weights = [1.2, 1.1, 0.5];
        assert_eq!(finder.nearest_by(&q, 2.0, |i| weights[i]), Some((2, 0.5)));
        assert_eq!(finder.nearest_by(&q, 1.2, |i| weights[i]), Some((1, 1.1)));
        assert_eq!(finder.nearest_by(&q, 1.2, |_| 3.0), Some((0, 3.0)));
        assert_eq!(finder.nearest_by(&q, 2.0, |_| f64::NAN), None);
    }

    #[test]
    fn test_non_finite_points_are_skipped() {
        let finder = StarFinder::new(vec![Point::new(f64::NAN, 0.0), Point::new(0.0, 0.0)], 1.0);
        assert_eq!(finder.len(), 2);
        assert_eq!(finder.nearest(&Point::new(0.1, 0.0), 1.0).map(|r| r.0), Some(1));
    }
}
