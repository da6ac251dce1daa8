//! Photometric mappings: instrumental flux (or magnitude) → calibrated value.

use crate::star::MeasuredStar;
use crate::transform::PhotometryTransform;

#[derive(Debug, Clone, PartialEq)]
pub struct SimplePhotometryMapping {
    transform: PhotometryTransform,
    error_transform: Option<PhotometryTransform>,
    index: Option<usize>,
    fixed: bool,
}

impl SimplePhotometryMapping {
    pub fn new(transform: PhotometryTransform) -> Self {
        Self {
            transform,
            error_transform: None,
            index: None,
            fixed: false,
        }
    }

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

    pub fn transform(&self) -> &PhotometryTransform {
        &self.transform
    }

    pub fn error_transform(&self) -> &PhotometryTransform {
        self.error_transform.as_ref().unwrap_or(&self.transform)
    }

    pub fn freeze_error_transform(&mut self) {
        self.error_transform = Some(self.transform.clone());
    }

    pub fn offset_params(&mut self, delta: &[f64]) {
        self.transform.offset_params(delta);
    }

    pub fn indices(&self, out: &mut Vec<usize>) {
        if let Some(start) = self.index {
            out.extend(start..start + self.n_par());
        }
    }
}

/// Instrumental value and error matching the flavor of `transform`.
fn instrumental(transform: &PhotometryTransform, ms: &MeasuredStar) -> (f64, f64) {
    if transform.is_flux() {
        (ms.inst_flux, ms.inst_flux_err)
    } else {
        (ms.inst_mag(), ms.inst_mag_err())
    }
}

/// Chip level evaluated at the pixel position, visit level at the
/// focal-plane position.
#[derive(Debug, Clone, Copy)]
pub struct ChipVisitPhotometryMapping<'a> {
    chip: &'a SimplePhotometryMapping,
    visit: &'a SimplePhotometryMapping,
}

impl<'a> ChipVisitPhotometryMapping<'a> {
    pub fn new(chip: &'a SimplePhotometryMapping, visit: &'a SimplePhotometryMapping) -> Self {
        Self { chip, visit }
    }

    pub fn n_par_chip(&self) -> usize {
        self.chip.n_par()
    }

    pub fn n_par_visit(&self) -> usize {
        self.visit.n_par()
    }
}

/// Mapping handed out by a photometry model for one CCD image.
#[derive(Debug, Clone, Copy)]
pub enum PhotometryMappingRef<'a> {
    Simple(&'a SimplePhotometryMapping),
    ChipVisit(ChipVisitPhotometryMapping<'a>),
}

impl PhotometryMappingRef<'_> {
    pub fn is_flux(&self) -> bool {
        match self {
            PhotometryMappingRef::Simple(m) => m.transform.is_flux(),
            PhotometryMappingRef::ChipVisit(cv) => cv.chip.transform.is_flux(),
        }
    }

    pub fn n_par(&self) -> usize {
        match self {
            PhotometryMappingRef::Simple(m) => m.n_par(),
            PhotometryMappingRef::ChipVisit(cv) => cv.n_par_chip() + cv.n_par_visit(),
        }
    }

    /// Global indices of the varied parameters, chip level first. Clears `out`.
    pub fn indices(&self, out: &mut Vec<usize>) {
        out.clear();
        match self {
            PhotometryMappingRef::Simple(m) => m.indices(out),
            PhotometryMappingRef::ChipVisit(cv) => {
                cv.chip.indices(out);
                cv.visit.indices(out);
            }
        }
    }

    /// Calibrated flux (or magnitude) of a detection.
    pub fn transform(&self, ms: &MeasuredStar) -> f64 {
        match self {
            PhotometryMappingRef::Simple(m) => {
                let (value, _) = instrumental(&m.transform, ms);
                m.transform.transform(ms.x, ms.y, value)
            }
            PhotometryMappingRef::ChipVisit(cv) => {
                let (value, _) = instrumental(&cv.chip.transform, ms);
                let mid = cv.chip.transform.transform(ms.x, ms.y, value);
                cv.visit.transform.transform(ms.x_focal, ms.y_focal, mid)
            }
        }
    }

    /// Error on [`transform`](Self::transform), through the error transforms.
    pub fn transform_error(&self, ms: &MeasuredStar) -> f64 {
        match self {
            PhotometryMappingRef::Simple(m) => {
                let (value, err) = instrumental(&m.transform, ms);
                m.error_transform().transform_error(ms.x, ms.y, value, err)
            }
            PhotometryMappingRef::ChipVisit(cv) => {
                let (value, err) = instrumental(&cv.chip.transform, ms);
                let chip = cv.chip.error_transform();
                let mid = chip.transform(ms.x, ms.y, value);
                let mid_err = chip.transform_error(ms.x, ms.y, value, err);
                cv.visit
                    .error_transform()
                    .transform_error(ms.x_focal, ms.y_focal, mid, mid_err)
            }
        }
    }

    /// Derivatives of [`transform`](Self::transform) w.r.t. the varied
    /// parameters, in [`indices`](Self::indices) order.
    pub fn compute_parameter_derivatives(&self, ms: &MeasuredStar, out: &mut [f64]) {
        match self {
            PhotometryMappingRef::Simple(m) => {
                if m.n_par() > 0 {
                    let (value, _) = instrumental(&m.transform, ms);
                    m.transform.parameter_derivatives(ms.x, ms.y, value, out);
                }
            }
            PhotometryMappingRef::ChipVisit(cv) => {
                let (value, _) = instrumental(&cv.chip.transform, ms);
                let n_chip = cv.n_par_chip();
                let n_visit = cv.n_par_visit();
                if n_chip > 0 {
                    cv.chip
                        .transform
                        .parameter_derivatives(ms.x, ms.y, value, &mut out[..n_chip]);
                    // ∂visit/∂mid: the visit factor for flux, 1 for magnitudes
                    if cv.visit.transform.is_flux() {
                        let scale = cv.visit.transform.factor(ms.x_focal, ms.y_focal);
                        for d in &mut out[..n_chip] {
                            *d *= scale;
                        }
                    }
                }
                if n_visit > 0 {
                    let mid = cv.chip.transform.transform(ms.x, ms.y, value);
                    cv.visit.transform.parameter_derivatives(
                        ms.x_focal,
                        ms.y_focal,
                        mid,
                        &mut out[n_chip..n_chip + n_visit],
                    );
                }
            }
        }
    }

    /// Total flux factor (or magnitude offset) at a pixel / focal position.
    pub fn factor(&self, x: f64, y: f64, x_focal: f64, y_focal: f64) -> f64 {
        match self {
            PhotometryMappingRef::Simple(m) => m.transform.factor(x, y),
            PhotometryMappingRef::ChipVisit(cv) => {
                let chip = cv.chip.transform.factor(x, y);
                let visit = cv.visit.transform.factor(x_focal, y_focal);
                if cv.chip.transform.is_flux() {
                    chip * visit
                } else {
                    chip + visit
                }
            }
        }
    }
}
