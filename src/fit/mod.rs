//! Gauss–Newton least-squares engine with iterative outlier rejection.
//!
//! A fit is a [`LeastSquaresProblem`]: it numbers its free parameters,
//! accumulates whitened Jacobian triplets and the gradient `Jᵀ W r`, applies
//! a parameter update and reports its chi2. [`minimize`] drives one problem
//! through solve → update → outlier rejection rounds:
//!
//! ```text
//! assign indices → accumulate → solve → offset → chi2
//!       ↑                                         │
//!       └──────── remove outliers ◄── outliers? ──┘
//! ```
//!
//! Each round is a single linearized step with no line search: the mappings
//! are low-order polynomials, close to linear in their own parameters.

pub mod astrometry;
pub mod photometry;
pub mod triplets;

pub use astrometry::AstrometryFit;
pub use photometry::PhotometryFit;
pub use triplets::{solve_normal_equations, TripletList};

use std::collections::HashSet;
use std::fmt;

use nalgebra::{DMatrix, DVector, Matrix2};
use tracing::{debug, info, warn};

use crate::error::{JointcalError, Result};
use crate::star::{FittedStarId, MeasuredStarId};

/// Outcome of [`minimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizeResult {
    /// No (more) outliers, or no outlier rejection requested.
    Converged,
    /// Chi2 went up after removing outliers.
    Chi2Increased,
    /// The normal equations could not be solved.
    Failed,
    /// The chi2 after the step is not finite.
    NonFinite,
}

/// Chi2 and degrees of freedom of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Chi2Statistic {
    pub chi2: f64,
    pub ndof: i64,
}

impl Chi2Statistic {
    pub fn per_dof(&self) -> f64 {
        self.chi2 / self.ndof as f64
    }
}

impl fmt::Display for Chi2Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chi2/ndof : {:.4}/{}={:.4}",
            self.chi2,
            self.ndof,
            self.per_dof()
        )
    }
}

/// A residual term that can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutlierTerm {
    /// A detection.
    Measurement(MeasuredStarId),
    /// The reference-star term of a fitted star.
    Reference(FittedStarId),
}

/// Candidate outlier with its chi2 contribution and the free parameters its
/// residual depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierCandidate {
    pub term: OutlierTerm,
    pub chi2: f64,
    pub indices: Vec<usize>,
}

/// Pick the outliers to remove in one round.
///
/// Candidates above `n_sigma` (in normalized residual) are taken worst first;
/// one that shares a free parameter with an already selected term is left
/// for a later round, since removing the first may fix it.
pub fn select_outliers(mut candidates: Vec<OutlierCandidate>, n_sigma: f64) -> Vec<OutlierTerm> {
    let cut = n_sigma * n_sigma;
    candidates.retain(|c| c.chi2 > cut);
    candidates.sort_by(|a, b| b.chi2.total_cmp(&a.chi2));

    let mut touched: HashSet<usize> = HashSet::new();
    let mut selected = Vec::new();
    for c in candidates {
        if c.indices.iter().any(|i| touched.contains(i)) {
            continue;
        }
        touched.extend(c.indices.iter().copied());
        selected.push(c.term);
    }
    selected
}

/// Whitening factor `L` with `L Lᵀ = cov⁻¹`, or `None` for a singular or
/// non-finite covariance.
pub(crate) fn whitening(cov: &Matrix2<f64>) -> Option<(Matrix2<f64>, Matrix2<f64>)> {
    let weight = cov.try_inverse()?;
    if weight.iter().any(|w| !w.is_finite()) {
        return None;
    }
    let l = weight.cholesky()?.l();
    Some((weight, l))
}

/// Accumulate one 2D residual term: `h` holds `∂r/∂θ` (`indices.len() × 2`).
pub(crate) fn accumulate_2d(
    triplets: &mut TripletList,
    gradient: &mut Vec<(usize, f64)>,
    indices: &[usize],
    h: &DMatrix<f64>,
    residual: &nalgebra::Vector2<f64>,
    weight: &Matrix2<f64>,
    l: &Matrix2<f64>,
) {
    let eq = triplets.next_free_index();
    let wr = weight * residual;
    for (k, &ip) in indices.iter().enumerate() {
        let hx = h[(k, 0)];
        let hy = h[(k, 1)];
        // columns of h·L
        for col in 0..2 {
            let v = hx * l[(0, col)] + hy * l[(1, col)];
            if v != 0.0 {
                triplets.add(ip, eq + col, v);
            }
        }
        gradient.push((ip, hx * wr.x + hy * wr.y));
    }
    triplets.set_next_free_index(eq + 2);
}

/// Accumulate one scalar residual term with derivatives `h`.
pub(crate) fn accumulate_1d(
    triplets: &mut TripletList,
    gradient: &mut Vec<(usize, f64)>,
    indices: &[usize],
    h: &[f64],
    residual: f64,
    sigma: f64,
) {
    let eq = triplets.next_free_index();
    let w = 1.0 / (sigma * sigma);
    for (&ip, &d) in indices.iter().zip(h) {
        if d != 0.0 {
            triplets.add(ip, eq, d / sigma);
        }
        gradient.push((ip, d * w * residual));
    }
    triplets.set_next_free_index(eq + 1);
}

/// Per-image partial result of a derivative pass.
#[derive(Debug, Default)]
pub(crate) struct PartialSystem {
    pub triplets: TripletList,
    pub gradient: Vec<(usize, f64)>,
}

impl PartialSystem {
    pub fn merge_into(self, triplets: &mut TripletList, gradient: &mut DVector<f64>) {
        triplets.append(self.triplets);
        for (i, g) in self.gradient {
            gradient[i] += g;
        }
    }
}

/// What the engine needs from a fit.
pub trait LeastSquaresProblem {
    /// Number the parameters selected by `what`; returns the total count.
    fn assign_indices(&mut self, what: &str) -> Result<usize>;

    fn n_par_total(&self) -> usize;

    /// Accumulate the whitened Jacobian and the gradient `Jᵀ W r`.
    fn ls_derivatives(&self, triplets: &mut TripletList, gradient: &mut DVector<f64>) -> Result<()>;

    /// Apply `delta`, which must have exactly `n_par_total` entries.
    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()>;

    fn compute_chi2(&self) -> Result<Chi2Statistic>;

    /// Every included residual term with its chi2 contribution.
    fn outlier_candidates(&self) -> Result<Vec<OutlierCandidate>>;

    fn remove_outliers(&mut self, outliers: &[OutlierTerm]);

    /// Terms to reject this round at `n_sigma`.
    fn find_outliers(&self, n_sigma: f64) -> Result<Vec<OutlierTerm>> {
        Ok(select_outliers(self.outlier_candidates()?, n_sigma))
    }
}

/// Check an update vector against the current parameter count.
pub(crate) fn check_delta(delta: &DVector<f64>, expected: usize) -> Result<()> {
    if delta.len() != expected {
        return Err(JointcalError::SizeMismatch {
            expected,
            got: delta.len(),
        });
    }
    Ok(())
}

/// Run solve / update / outlier-rejection rounds for `what`.
///
/// `n_sigma_cut <= 0` performs a single step without outlier rejection.
pub fn minimize<P: LeastSquaresProblem + ?Sized>(
    problem: &mut P,
    what: &str,
    n_sigma_cut: f64,
) -> Result<MinimizeResult> {
    let mut capacity_hint = 0usize;
    let mut previous: Option<Chi2Statistic> = None;
    let mut total_outliers = 0usize;

    loop {
        let n_par = problem.assign_indices(what)?;
        if n_par == 0 {
            return Err(JointcalError::NothingToFit(what.to_string()));
        }

        let mut triplets = TripletList::with_capacity(capacity_hint);
        let mut gradient = DVector::zeros(n_par);
        problem.ls_derivatives(&mut triplets, &mut gradient)?;
        capacity_hint = triplets.len();
        debug!(
            "{}: {} parameters, {} equations, {} triplets",
            what,
            n_par,
            triplets.next_free_index(),
            triplets.len()
        );

        let Some(delta) = solve_normal_equations(n_par, triplets, &gradient)? else {
            warn!("{}: normal equations could not be solved", what);
            return Ok(MinimizeResult::Failed);
        };
        problem.offset_params(&delta)?;

        let chi2 = problem.compute_chi2()?;
        if !chi2.chi2.is_finite() {
            warn!("{}: chi2 is not finite", what);
            return Ok(MinimizeResult::NonFinite);
        }
        debug!("{}: {}", what, chi2);

        if n_sigma_cut <= 0.0 {
            return Ok(MinimizeResult::Converged);
        }
        if let Some(prev) = previous {
            if chi2.chi2 > prev.chi2 {
                warn!(
                    "{}: chi2 increased from {} to {} after removing outliers",
                    what, prev, chi2
                );
                return Ok(MinimizeResult::Chi2Increased);
            }
        }

        let outliers = problem.find_outliers(n_sigma_cut)?;
        if outliers.is_empty() {
            if total_outliers > 0 {
                info!("{}: removed {} outliers in total", what, total_outliers);
            }
            return Ok(MinimizeResult::Converged);
        }
        debug!("{}: removing {} outliers", what, outliers.len());
        total_outliers += outliers.len();
        problem.remove_outliers(&outliers);
        previous = Some(chi2);
    }
}

/// The seam the calibration loop drives fits through.
pub trait Fitter {
    fn minimize(&mut self, what: &str, n_sigma_cut: f64) -> Result<MinimizeResult>;

    fn compute_chi2(&self) -> Result<Chi2Statistic>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(term: usize, chi2: f64, indices: Vec<usize>) -> OutlierCandidate {
        OutlierCandidate {
            term: OutlierTerm::Measurement(MeasuredStarId { ccd: 0, index: term }),
            chi2,
            indices,
        }
    }

    #[test]
    fn test_select_outliers_worst_first_without_shared_parameters() {
        let selected = select_outliers(
            vec![
                candidate(0, 30.0, vec![1, 2]),
                candidate(1, 100.0, vec![2, 3]),
                candidate(2, 50.0, vec![4]),
                candidate(3, 4.0, vec![5]),
            ],
            3.0,
        );
        let ids: Vec<usize> = selected
            .iter()
            .map(|t| match t {
                OutlierTerm::Measurement(m) => m.index,
                OutlierTerm::Reference(f) => f.0,
            })
            .collect();
        // #0 shares parameter 2 with the worse #1; #3 is below 3σ
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_chi2_display() {
        let c = Chi2Statistic { chi2: 10.0, ndof: 5 };
        assert_eq!(c.per_dof(), 2.0);
        assert_eq!(c.to_string(), "chi2/ndof : 10.0000/5=2.0000");
    }

    #[test]
    fn test_whitening_reproduces_weight() {
        let cov = Matrix2::new(4.0, 1.0, 1.0, 9.0);
        let (w, l) = whitening(&cov).unwrap();
        assert!((l * l.transpose() - w).abs().max() < 1e-12);
        assert!(whitening(&Matrix2::new(1.0, 1.0, 1.0, 1.0)).is_none());
    }

    /// Linear problem `θ = target` with unit weights.
    struct Toy {
        theta: Vec<f64>,
        target: Vec<f64>,
        excluded: HashSet<usize>,
    }

    impl LeastSquaresProblem for Toy {
        fn assign_indices(&mut self, _what: &str) -> Result<usize> {
            Ok(self.theta.len())
        }

        fn n_par_total(&self) -> usize {
            self.theta.len()
        }

        fn ls_derivatives(&self, triplets: &mut TripletList, gradient: &mut DVector<f64>) -> Result<()> {
            let mut partial = PartialSystem::default();
            for (i, (t, y)) in self.theta.iter().zip(&self.target).enumerate() {
                accumulate_1d(&mut partial.triplets, &mut partial.gradient, &[i], &[1.0], t - y, 1.0);
            }
            partial.merge_into(triplets, gradient);
            Ok(())
        }

        fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()> {
            check_delta(delta, self.theta.len())?;
            for (t, d) in self.theta.iter_mut().zip(delta.iter()) {
                *t += d;
            }
            Ok(())
        }

        fn compute_chi2(&self) -> Result<Chi2Statistic> {
            let chi2 = self
                .theta
                .iter()
                .zip(&self.target)
                .map(|(t, y)| (t - y).powi(2))
                .sum();
            Ok(Chi2Statistic { chi2, ndof: 0 })
        }

        fn outlier_candidates(&self) -> Result<Vec<OutlierCandidate>> {
            Ok(Vec::new())
        }

        fn remove_outliers(&mut self, outliers: &[OutlierTerm]) {
            for o in outliers {
                if let OutlierTerm::Measurement(m) = o {
                    self.excluded.insert(m.index);
                }
            }
        }
    }

    #[test]
    fn test_minimize_linear_problem_in_one_step() {
        let mut toy = Toy {
            theta: vec![0.0, 5.0, -1.0],
            target: vec![1.0, 2.0, 3.0],
            excluded: HashSet::new(),
        };
        assert_eq!(minimize(&mut toy, "all", 0.0), Ok(MinimizeResult::Converged));
        for (t, y) in toy.theta.iter().zip(&toy.target) {
            assert!((t - y).abs() < 1e-12);
        }
        assert!(toy.excluded.is_empty());
        assert_eq!(
            toy.offset_params(&DVector::zeros(2)),
            Err(JointcalError::SizeMismatch {
                expected: 3,
                got: 2
            })
        );
    }
}
