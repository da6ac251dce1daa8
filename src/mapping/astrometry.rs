//! Geometric mappings: pixel → common tangent plane.

use nalgebra::{DMatrix, Matrix2};

use crate::geom::{Frame, Point};
use crate::transform::{AstrometryTransform, LinearTransform};

/// One geometric transform bound to a slice of the parameter vector.
///
/// The transform acts on inputs normalized by `normalizer`, which keeps
/// polynomial coefficients well conditioned whatever the input units.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleAstrometryMapping {
    normalizer: LinearTransform,
    transform: AstrometryTransform,
    /// Frozen copy used for error propagation; `None` means "same as
    /// `transform`".
    error_transform: Option<AstrometryTransform>,
    index: Option<usize>,
    fixed: bool,
}

impl SimpleAstrometryMapping {
    /// Mapping whose transform already expects normalized inputs.
    pub fn new(normalizer: LinearTransform, transform: AstrometryTransform) -> Self {
        Self {
            normalizer,
            transform,
            error_transform: None,
            index: None,
            fixed: false,
        }
    }

    /// Mapping equivalent to `pixel_transform`, re-expressed over inputs
    /// normalized across `domain`.
    pub fn from_input_transform(domain: &Frame, pixel_transform: &AstrometryTransform) -> Self {
        let normalizer = LinearTransform::normalizing(domain);
        // normalizing() is never singular: degenerate axes get unit scale
        let denormalize = normalizer
            .inverted()
            .unwrap_or_else(|_| LinearTransform::identity());
        let transform = pixel_transform.compose(&AstrometryTransform::Linear(denormalize));
        Self::new(normalizer, transform)
    }

    /// Mapping with no parameters that returns its input.
    pub fn identity() -> Self {
        let mut mapping = Self::new(LinearTransform::identity(), AstrometryTransform::Identity);
        mapping.fixed = true;
        mapping
    }

    /// Parameters currently varied: zero when fixed.
    pub fn n_par(&self) -> usize {
        if self.fixed {
            0
        } else {
            self.transform.n_params()
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    pub fn transform(&self) -> &AstrometryTransform {
        &self.transform
    }

    pub fn normalizer(&self) -> &LinearTransform {
        &self.normalizer
    }

    pub fn error_transform(&self) -> &AstrometryTransform {
        self.error_transform.as_ref().unwrap_or(&self.transform)
    }

    /// Fork the error transform off the current value transform.
    pub fn freeze_error_transform(&mut self) {
        self.error_transform = Some(self.transform.clone());
    }

    pub fn offset_params(&mut self, delta: &[f64]) {
        self.transform.offset_params(delta);
    }

    /// Indices of the varied parameters, appended to `out`.
    pub fn indices(&self, out: &mut Vec<usize>) {
        if let Some(start) = self.index {
            out.extend(start..start + self.n_par());
        }
    }

    pub fn apply(&self, p: &Point) -> Point {
        self.transform.apply(&self.normalizer.apply(p))
    }

    /// Whole mapping as one transform on un-normalized inputs.
    pub fn input_transform(&self) -> AstrometryTransform {
        self.transform
            .compose(&AstrometryTransform::Linear(self.normalizer))
    }

    /// Jacobian of [`apply`](Self::apply) w.r.t. the input.
    pub fn derivative(&self, p: &Point) -> Matrix2<f64> {
        self.transform.derivative(&self.normalizer.apply(p)) * self.normalizer.matrix()
    }

    /// Jacobian of the error transform w.r.t. the input.
    pub fn error_derivative(&self, p: &Point) -> Matrix2<f64> {
        self.error_transform().derivative(&self.normalizer.apply(p)) * self.normalizer.matrix()
    }

    /// Output derivatives w.r.t. the varied parameters (`n_par × 2`).
    pub fn parameter_derivatives(&self, p: &Point, out: &mut DMatrix<f64>) {
        if self.n_par() > 0 {
            self.transform
                .parameter_derivatives(&self.normalizer.apply(p), out);
        }
    }
}

/// Output position and covariance of `p` through `mapping`.
fn propagate(mapping: &SimpleAstrometryMapping, p: &Point, cov: &Matrix2<f64>) -> (Point, Matrix2<f64>) {
    let d = mapping.error_derivative(p);
    (mapping.apply(p), d * cov * d.transpose())
}

/// Two-level mapping `visit(chip(p))` borrowing its leaves from a model.
#[derive(Debug, Clone, Copy)]
pub struct ChipVisitAstrometryMapping<'a> {
    chip: &'a SimpleAstrometryMapping,
    visit: &'a SimpleAstrometryMapping,
}

impl<'a> ChipVisitAstrometryMapping<'a> {
    pub fn new(chip: &'a SimpleAstrometryMapping, visit: &'a SimpleAstrometryMapping) -> Self {
        Self { chip, visit }
    }

    pub fn n_par_chip(&self) -> usize {
        self.chip.n_par()
    }

    pub fn n_par_visit(&self) -> usize {
        self.visit.n_par()
    }

    pub fn chip(&self) -> &'a SimpleAstrometryMapping {
        self.chip
    }

    pub fn visit(&self) -> &'a SimpleAstrometryMapping {
        self.visit
    }
}

/// Mapping handed out by an astrometry model for one CCD image.
#[derive(Debug, Clone, Copy)]
pub enum AstrometryMappingRef<'a> {
    Simple(&'a SimpleAstrometryMapping),
    ChipVisit(ChipVisitAstrometryMapping<'a>),
}

impl AstrometryMappingRef<'_> {
    pub fn n_par(&self) -> usize {
        match self {
            AstrometryMappingRef::Simple(m) => m.n_par(),
            AstrometryMappingRef::ChipVisit(cv) => cv.n_par_chip() + cv.n_par_visit(),
        }
    }

    /// Global indices of the varied parameters, chip level first. Clears `out`.
    pub fn indices(&self, out: &mut Vec<usize>) {
        out.clear();
        match self {
            AstrometryMappingRef::Simple(m) => m.indices(out),
            AstrometryMappingRef::ChipVisit(cv) => {
                cv.chip.indices(out);
                cv.visit.indices(out);
            }
        }
    }

    pub fn transform(&self, p: &Point) -> Point {
        match self {
            AstrometryMappingRef::Simple(m) => m.apply(p),
            AstrometryMappingRef::ChipVisit(cv) => cv.visit.apply(&cv.chip.apply(p)),
        }
    }

    /// Mapped position and its covariance, given the input covariance.
    pub fn transform_pos_and_errors(&self, p: &Point, cov: &Matrix2<f64>) -> (Point, Matrix2<f64>) {
        match self {
            AstrometryMappingRef::Simple(m) => propagate(m, p, cov),
            AstrometryMappingRef::ChipVisit(cv) => {
                let (mid, mid_cov) = propagate(cv.chip, p, cov);
                propagate(cv.visit, &mid, &mid_cov)
            }
        }
    }

    /// Mapped position, filling `h` (`n_par × 2`) with its parameter
    /// derivatives in [`indices`](Self::indices) order.
    pub fn compute_transform_and_derivatives(&self, p: &Point, h: &mut DMatrix<f64>) -> Point {
        match self {
            AstrometryMappingRef::Simple(m) => {
                m.parameter_derivatives(p, h);
                m.apply(p)
            }
            AstrometryMappingRef::ChipVisit(cv) => {
                let mid = cv.chip.apply(p);
                let n_chip = cv.n_par_chip();
                let n_visit = cv.n_par_visit();
                if n_chip > 0 {
                    let mut chip_h = DMatrix::zeros(n_chip, 2);
                    cv.chip.parameter_derivatives(p, &mut chip_h);
                    let d_visit = cv.visit.derivative(&mid);
                    // Row k of the chip block: d_visit · (∂chip/∂θ_k)
                    let chained = chip_h * d_visit.transpose();
                    h.view_mut((0, 0), (n_chip, 2)).copy_from(&chained);
                }
                if n_visit > 0 {
                    let mut visit_h = DMatrix::zeros(n_visit, 2);
                    cv.visit.parameter_derivatives(&mid, &mut visit_h);
                    h.view_mut((n_chip, 0), (n_visit, 2)).copy_from(&visit_h);
                }
                cv.visit.apply(&mid)
            }
        }
    }
}
