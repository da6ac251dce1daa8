//! Sparse Jacobian assembly.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use tracing::debug;

use crate::error::{JointcalError, Result};

/// Growing list of `(parameter, equation, value)` entries of the transposed,
/// whitened Jacobian.
///
/// Rows are parameters and columns are equations, so the normal matrix is
/// `J Jᵀ` of the assembled matrix. Equation numbers are handed out by
/// [`next_free_index`](Self::next_free_index) and advanced with
/// [`set_next_free_index`](Self::set_next_free_index).
#[derive(Debug, Clone, Default)]
pub struct TripletList {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
    next_free_index: usize,
}

impl TripletList {
    /// Empty list with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            cols: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            next_free_index: 0,
        }
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn next_free_index(&self) -> usize {
        self.next_free_index
    }

    pub fn set_next_free_index(&mut self, index: usize) {
        self.next_free_index = index;
    }

    /// Append `other`, renumbering its equations after the ones already here.
    pub fn append(&mut self, other: TripletList) {
        let offset = self.next_free_index;
        self.rows.extend(other.rows);
        self.cols.extend(other.cols.into_iter().map(|c| c + offset));
        self.values.extend(other.values);
        self.next_free_index += other.next_free_index;
    }
}

/// Solve `(J Jᵀ) δ = −g` for the Gauss–Newton step.
///
/// `Err` reports an assembly problem (an entry outside the declared
/// dimensions). `Ok(None)` reports a numerical failure: an unconstrained
/// parameter, a failed factorization or a non-finite solution.
pub fn solve_normal_equations(
    n_par: usize,
    triplets: TripletList,
    gradient: &DVector<f64>,
) -> Result<Option<DVector<f64>>> {
    let n_eq = triplets.next_free_index;
    let TripletList {
        rows, cols, values, ..
    } = triplets;
    let coo = CooMatrix::try_from_triplets(n_par, n_eq, rows, cols, values)
        .map_err(|e| JointcalError::SparseAssembly(e.to_string()))?;
    let jt = CscMatrix::from(&coo);
    let hessian = &jt * &jt.transpose();

    let mut diagonal = vec![0.0; n_par];
    for (i, j, v) in hessian.triplet_iter() {
        if i == j {
            diagonal[i] += *v;
        }
    }
    if let Some(k) = diagonal.iter().position(|d| !(*d > 0.0)) {
        debug!("Parameter {} is unconstrained", k);
        return Ok(None);
    }

    let factor = match CscCholesky::factor(&hessian) {
        Ok(f) => f,
        Err(e) => {
            debug!("Cholesky factorization failed: {:?}", e);
            return Ok(None);
        }
    };
    let rhs = DMatrix::from_iterator(n_par, 1, gradient.iter().map(|g| -g));
    let solution = factor.solve(&rhs);
    let delta = DVector::from_column_slice(solution.as_slice());
    if delta.iter().any(|d| !d.is_finite()) {
        return Ok(None);
    }
    Ok(Some(delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_renumbers_equations() {
        let mut a = TripletList::with_capacity(4);
        a.add(0, 0, 1.0);
        a.set_next_free_index(1);
        let mut b = TripletList::default();
        b.add(1, 0, 2.0);
        b.add(1, 1, 3.0);
        b.set_next_free_index(2);
        a.append(b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.cols, vec![0, 1, 2]);
        assert_eq!(a.next_free_index(), 3);
    }

    #[test]
    fn test_solve_small_system() {
        // Two parameters, three unit-weight equations: x = 1, y = 2, x + y = 3.
        // Residuals at zero are -1, -2, -3 so g = J r = (-4, -5).
        let mut t = TripletList::default();
        t.add(0, 0, 1.0);
        t.add(1, 1, 1.0);
        t.add(0, 2, 1.0);
        t.add(1, 2, 1.0);
        t.set_next_free_index(3);
        let g = DVector::from_vec(vec![-4.0, -5.0]);
        let delta = solve_normal_equations(2, t, &g).unwrap().unwrap();
        assert!((delta[0] - 1.0).abs() < 1e-12);
        assert!((delta[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unconstrained_parameter_fails() {
        let mut t = TripletList::default();
        t.add(0, 0, 1.0);
        t.set_next_free_index(1);
        let g = DVector::from_vec(vec![1.0, 0.0]);
        assert_eq!(solve_normal_equations(2, t, &g), Ok(None));
    }

    #[test]
    fn test_out_of_range_entry_is_an_error() {
        let mut t = TripletList::default();
        t.add(5, 0, 1.0);
        t.set_next_free_index(1);
        let g = DVector::from_vec(vec![0.0]);
        assert!(matches!(
            solve_normal_equations(1, t, &g),
            Err(JointcalError::SparseAssembly(_))
        ));
    }
}
