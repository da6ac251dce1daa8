//! Photometry models: instrumental → calibrated flux or magnitude.

use std::collections::BTreeMap;

use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::associations::Associations;
use crate::ccd_image::{CcdImage, CcdImageKey, PhotoCalib};
use crate::error::{JointcalError, Result};
use crate::geom::Frame;
use crate::mapping::{ChipVisitPhotometryMapping, PhotometryMappingRef, SimplePhotometryMapping};
use crate::star::AB_ZERO_POINT_NJY;
use crate::transform::{PhotometryPolynomial, PhotometryTransform};

use super::{param_slice, FitComponents};

/// Whether a model calibrates fluxes (multiplicative) or magnitudes
/// (additive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometryKind {
    Flux,
    Magnitude,
}

impl PhotometryKind {
    /// Transform equivalent to a constant calibration `mean` (nJy per count).
    fn constant(self, mean: f64) -> PhotometryTransform {
        match self {
            PhotometryKind::Flux => PhotometryTransform::FluxScale(mean),
            PhotometryKind::Magnitude => {
                PhotometryTransform::MagnitudeOffset(magnitude_offset(mean))
            }
        }
    }

    /// Polynomial over `frame`, equal to the constant `value` everywhere.
    fn polynomial(self, order: u32, frame: Frame, value: f64) -> PhotometryTransform {
        let p = PhotometryPolynomial::constant(order, frame, value);
        match self {
            PhotometryKind::Flux => PhotometryTransform::FluxPolynomial(p),
            PhotometryKind::Magnitude => PhotometryTransform::MagnitudePolynomial(p),
        }
    }

    /// Flux factor implied by a model factor (identity for flux models).
    fn flux_factor(self, factor: f64) -> f64 {
        match self {
            PhotometryKind::Flux => factor,
            PhotometryKind::Magnitude => 10f64.powf(-0.4 * (factor - AB_ZERO_POINT_NJY)),
        }
    }
}

/// Magnitude offset turning an instrumental magnitude into an AB magnitude
/// for a calibration of `mean` nJy per count.
fn magnitude_offset(mean: f64) -> f64 {
    -2.5 * mean.log10() + AB_ZERO_POINT_NJY
}

/// Capabilities the photometric fit needs from a model.
pub trait PhotometryModel: Sync {
    fn kind(&self) -> PhotometryKind;

    fn mapping(&self, ccd: &CcdImage) -> Result<PhotometryMappingRef<'_>>;

    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize;

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()>;

    fn freeze_error_transform(&mut self);

    fn total_parameters(&self) -> usize;

    /// Mean flux calibration of `ccd` over its bounding box.
    fn calibration(&self, ccd: &CcdImage) -> Result<PhotoCalib> {
        let mapping = self.mapping(ccd)?;
        let samples = ccd.bbox().grid(5);
        let sum: f64 = samples
            .iter()
            .map(|p| {
                let focal = ccd.pixel_to_focal().apply(p);
                self.kind()
                    .flux_factor(mapping.factor(p.x, p.y, focal.x, focal.y))
            })
            .sum();
        let mean = sum / samples.len() as f64;
        let input = ccd.photo_calib();
        let err = if input.mean != 0.0 {
            (input.err / input.mean * mean).abs()
        } else {
            input.err
        };
        Ok(PhotoCalib { mean, err })
    }

    /// True when every image has a finite, positive calibration.
    fn validate(&self, ccd_images: &[CcdImage]) -> bool {
        let mut ok = true;
        for ccd in ccd_images {
            match self.calibration(ccd) {
                Ok(calib) if calib.mean.is_finite() && calib.mean > 0.0 => {}
                Ok(calib) => {
                    warn!(
                        "CcdImage {} has a non-positive calibration {}",
                        ccd.name(),
                        calib.mean
                    );
                    ok = false;
                }
                Err(e) => {
                    warn!("CcdImage {}: {}", ccd.name(), e);
                    ok = false;
                }
            }
        }
        ok
    }
}

fn offset_leaf(leaf: &mut SimplePhotometryMapping, delta: &DVector<f64>) -> Result<()> {
    let n = leaf.n_par();
    if let Some(start) = leaf.index() {
        if n > 0 {
            leaf.offset_params(param_slice(delta, start, n)?);
        }
    }
    Ok(())
}

fn assign_leaf(leaf: &mut SimplePhotometryMapping, fixed: bool, next: &mut usize) {
    leaf.set_fixed(fixed);
    if fixed {
        leaf.set_index(None);
    } else {
        leaf.set_index(Some(*next));
        *next += leaf.n_par();
    }
}

// ── Simple model ────────────────────────────────────────────────────────────

/// One independent photometric transform per CCD image.
///
/// Order 0 is a single scale (or offset); higher orders are polynomials over
/// the image bounding box.
#[derive(Debug, Clone)]
pub struct SimplePhotometryModel {
    kind: PhotometryKind,
    mappings: BTreeMap<CcdImageKey, SimplePhotometryMapping>,
}

impl SimplePhotometryModel {
    pub fn new(associations: &Associations, kind: PhotometryKind, order: u32) -> Self {
        let mappings: BTreeMap<CcdImageKey, SimplePhotometryMapping> = associations
            .ccd_images()
            .iter()
            .map(|ccd| {
                let mean = ccd.photo_calib().mean;
                let transform = if order == 0 {
                    kind.constant(mean)
                } else {
                    let value = match kind {
                        PhotometryKind::Flux => mean,
                        PhotometryKind::Magnitude => magnitude_offset(mean),
                    };
                    kind.polynomial(order, *ccd.bbox(), value)
                };
                (ccd.key(), SimplePhotometryMapping::new(transform))
            })
            .collect();
        info!(
            "SimplePhotometryModel ({:?}): {} mappings of order {}",
            kind,
            mappings.len(),
            order
        );
        Self { kind, mappings }
    }
}

impl PhotometryModel for SimplePhotometryModel {
    fn kind(&self) -> PhotometryKind {
        self.kind
    }

    fn mapping(&self, ccd: &CcdImage) -> Result<PhotometryMappingRef<'_>> {
        self.mappings
            .get(&ccd.key())
            .map(PhotometryMappingRef::Simple)
            .ok_or(JointcalError::MappingNotFound(ccd.key()))
    }

    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize {
        let mut next = first_index;
        for mapping in self.mappings.values_mut() {
            assign_leaf(mapping, !components.model(), &mut next);
        }
        debug!("SimplePhotometryModel: indices {}..{}", first_index, next);
        next
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()> {
        for mapping in self.mappings.values_mut() {
            offset_leaf(mapping, delta)?;
        }
        Ok(())
    }

    fn freeze_error_transform(&mut self) {
        for mapping in self.mappings.values_mut() {
            mapping.freeze_error_transform();
        }
    }

    fn total_parameters(&self) -> usize {
        self.mappings.values().map(|m| m.transform().n_params()).sum()
    }
}

// ── Constrained model ───────────────────────────────────────────────────────

/// Constant per-detector factor times a per-exposure polynomial over the
/// focal plane. The detector with the smallest id is held fixed, which
/// removes the degeneracy between the two levels.
#[derive(Debug, Clone)]
pub struct ConstrainedPhotometryModel {
    kind: PhotometryKind,
    chips: BTreeMap<i32, SimplePhotometryMapping>,
    visits: BTreeMap<i64, SimplePhotometryMapping>,
    reference_chip: i32,
}

impl ConstrainedPhotometryModel {
    pub fn new(associations: &Associations, kind: PhotometryKind, visit_order: u32) -> Result<Self> {
        let images = associations.ccd_images();
        let reference_chip = images
            .iter()
            .map(CcdImage::ccd)
            .min()
            .ok_or(JointcalError::NoCcdImages)?;

        let focal_corners: Vec<_> = images
            .iter()
            .flat_map(|ccd| {
                ccd.bbox()
                    .corners()
                    .map(|c| ccd.pixel_to_focal().apply(&c))
            })
            .collect();
        let focal_frame = Frame::around(&focal_corners).ok_or(JointcalError::NoCcdImages)?;

        // Chip levels start from the calibration of their earliest visit.
        let mut chips = BTreeMap::new();
        let mut ordered: Vec<&CcdImage> = images.iter().collect();
        ordered.sort_by_key(|ccd| ccd.key());
        for ccd in &ordered {
            chips
                .entry(ccd.ccd())
                .or_insert_with(|| SimplePhotometryMapping::new(kind.constant(ccd.photo_calib().mean)));
        }

        let neutral = match kind {
            PhotometryKind::Flux => 1.0,
            PhotometryKind::Magnitude => 0.0,
        };
        let visits = ordered
            .iter()
            .map(|ccd| {
                (
                    ccd.visit(),
                    SimplePhotometryMapping::new(kind.polynomial(visit_order, focal_frame, neutral)),
                )
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            "ConstrainedPhotometryModel ({:?}): {} chips, {} visits of order {}, reference chip {}",
            kind,
            chips.len(),
            visits.len(),
            visit_order,
            reference_chip
        );
        Ok(Self {
            kind,
            chips,
            visits,
            reference_chip,
        })
    }

    pub fn reference_chip(&self) -> i32 {
        self.reference_chip
    }
}

impl PhotometryModel for ConstrainedPhotometryModel {
    fn kind(&self) -> PhotometryKind {
        self.kind
    }

    fn mapping(&self, ccd: &CcdImage) -> Result<PhotometryMappingRef<'_>> {
        match (self.chips.get(&ccd.ccd()), self.visits.get(&ccd.visit())) {
            (Some(chip), Some(visit)) => Ok(PhotometryMappingRef::ChipVisit(
                ChipVisitPhotometryMapping::new(chip, visit),
            )),
            _ => Err(JointcalError::MappingNotFound(ccd.key())),
        }
    }

    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize {
        let mut next = first_index;
        for (chip, mapping) in self.chips.iter_mut() {
            let fixed = !components.chip || *chip == self.reference_chip;
            assign_leaf(mapping, fixed, &mut next);
        }
        for mapping in self.visits.values_mut() {
            assign_leaf(mapping, !components.visit, &mut next);
        }
        debug!(
            "ConstrainedPhotometryModel: indices {}..{}",
            first_index, next
        );
        next
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()> {
        for leaf in self.chips.values_mut().chain(self.visits.values_mut()) {
            offset_leaf(leaf, delta)?;
        }
        Ok(())
    }

    fn freeze_error_transform(&mut self) {
        for leaf in self.chips.values_mut().chain(self.visits.values_mut()) {
            leaf.freeze_error_transform();
        }
    }

    fn total_parameters(&self) -> usize {
        self.chips
            .values()
            .chain(self.visits.values())
            .map(|m| m.transform().n_params())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude_offset_matches_flux_calibration() {
        let mean = 0.037;
        let offset = magnitude_offset(mean);
        let inst_flux: f64 = 12345.0;
        let mag = -2.5 * inst_flux.log10() + offset;
        let flux = inst_flux * mean;
        assert!((mag - (-2.5 * flux.log10() + AB_ZERO_POINT_NJY)).abs() < 1e-12);
        assert!((PhotometryKind::Magnitude.flux_factor(offset) - mean).abs() < 1e-12);
        assert_eq!(PhotometryKind::Flux.flux_factor(mean), mean);
    }
}
