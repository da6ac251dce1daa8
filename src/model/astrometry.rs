//! Astrometry models: pixel → common tangent plane for every CCD image.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;
use tracing::{debug, info};

use crate::associations::Associations;
use crate::ccd_image::{CcdImage, CcdImageKey};
use crate::error::{JointcalError, Result};
use crate::geom::{Frame, Point, SkyPoint};
use crate::mapping::{AstrometryMappingRef, ChipVisitAstrometryMapping, SimpleAstrometryMapping};
use crate::transform::{AstrometryPolynomial, AstrometryTransform, SkyWcs};

use super::{param_slice, FitComponents};

/// Capabilities the astrometric fit needs from a model.
pub trait AstrometryModel: Sync {
    /// Mapping of `ccd`; fails for an image the model was not built with.
    fn mapping(&self, ccd: &CcdImage) -> Result<AstrometryMappingRef<'_>>;

    /// Assign indices to the mappings selected by `components`, starting at
    /// `first_index`. Returns the next free index.
    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize;

    /// Apply the model's slice of `delta`.
    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()>;

    fn freeze_error_transform(&mut self);

    /// Number of parameters over all mappings, fitted or not.
    fn total_parameters(&self) -> usize;

    /// Fitted pixel → sky WCS of `ccd`.
    fn make_sky_wcs(&self, ccd: &CcdImage) -> Result<SkyWcs>;
}

/// Sample the initial WCS of `ccd` over its bounding box as
/// (pixel, common tangent plane) pairs.
fn wcs_samples(ccd: &CcdImage, n: usize) -> Result<Vec<(Point, Point)>> {
    ccd.bbox()
        .grid(n)
        .into_iter()
        .map(|p| Ok((p, ccd.pixel_to_common_tangent_plane(&p)?)))
        .collect()
}

fn offset_leaf(leaf: &mut SimpleAstrometryMapping, delta: &DVector<f64>) -> Result<()> {
    let n = leaf.n_par();
    if let Some(start) = leaf.index() {
        if n > 0 {
            let slice = param_slice(delta, start, n)?;
            leaf.offset_params(slice);
        }
    }
    Ok(())
}

fn assign_leaf(leaf: &mut SimpleAstrometryMapping, fixed: bool, next: &mut usize) {
    leaf.set_fixed(fixed);
    if fixed {
        leaf.set_index(None);
    } else {
        leaf.set_index(Some(*next));
        *next += leaf.n_par();
    }
}

// ── Simple model ────────────────────────────────────────────────────────────

/// One independent polynomial per CCD image.
#[derive(Debug, Clone)]
pub struct SimpleAstrometryModel {
    mappings: BTreeMap<CcdImageKey, SimpleAstrometryMapping>,
    /// Images whose mapping is never fitted.
    held_fixed: BTreeSet<CcdImageKey>,
    tangent_point: SkyPoint,
}

impl SimpleAstrometryModel {
    /// Initialize every mapping from the image's WCS, as a polynomial of
    /// `order` (≥ 1). The first `n_not_fit` images are held fixed.
    pub fn new(associations: &Associations, order: u32, n_not_fit: usize) -> Result<Self> {
        let order = order.max(1);
        let tangent_point = associations.common_tangent_point()?;
        let mut mappings = BTreeMap::new();
        let mut held_fixed = BTreeSet::new();
        for (i, ccd) in associations.ccd_images().iter().enumerate() {
            let samples = wcs_samples(ccd, 2 * order as usize + 4)?;
            let poly = AstrometryPolynomial::fit(&samples, order)?;
            let mapping = SimpleAstrometryMapping::from_input_transform(
                ccd.bbox(),
                &AstrometryTransform::Polynomial(poly),
            );
            mappings.insert(ccd.key(), mapping);
            if i < n_not_fit {
                held_fixed.insert(ccd.key());
            }
        }
        info!(
            "SimpleAstrometryModel: {} mappings of order {} ({} held fixed)",
            mappings.len(),
            order,
            held_fixed.len()
        );
        Ok(Self {
            mappings,
            held_fixed,
            tangent_point,
        })
    }

    pub fn mapping_for(&self, key: &CcdImageKey) -> Option<&SimpleAstrometryMapping> {
        self.mappings.get(key)
    }
}

impl AstrometryModel for SimpleAstrometryModel {
    fn mapping(&self, ccd: &CcdImage) -> Result<AstrometryMappingRef<'_>> {
        self.mappings
            .get(&ccd.key())
            .map(AstrometryMappingRef::Simple)
            .ok_or(JointcalError::MappingNotFound(ccd.key()))
    }

    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize {
        let mut next = first_index;
        for (key, mapping) in self.mappings.iter_mut() {
            let fixed = !components.model() || self.held_fixed.contains(key);
            assign_leaf(mapping, fixed, &mut next);
        }
        debug!(
            "SimpleAstrometryModel: indices {}..{}",
            first_index, next
        );
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

    fn make_sky_wcs(&self, ccd: &CcdImage) -> Result<SkyWcs> {
        let mapping = self
            .mappings
            .get(&ccd.key())
            .ok_or(JointcalError::MappingNotFound(ccd.key()))?;
        Ok(SkyWcs::new(self.tangent_point, mapping.input_transform()))
    }
}

// ── Constrained model ───────────────────────────────────────────────────────

/// Per-detector (chip) mappings shared by every exposure, followed by
/// per-exposure (visit) mappings shared by every detector.
///
/// The chip level maps pixels into the tangent plane of the reference
/// visit, whose own visit mapping is the identity and never fitted.
#[derive(Debug, Clone)]
pub struct ConstrainedAstrometryModel {
    chips: BTreeMap<i32, SimpleAstrometryMapping>,
    visits: BTreeMap<i64, SimpleAstrometryMapping>,
    reference_visit: i64,
    tangent_point: SkyPoint,
}

impl ConstrainedAstrometryModel {
    pub fn new(associations: &Associations, chip_order: u32, visit_order: u32) -> Result<Self> {
        let chip_order = chip_order.max(1);
        let visit_order = visit_order.max(1);
        let tangent_point = associations.common_tangent_point()?;
        let images = associations.ccd_images();
        let reference_visit = images
            .iter()
            .map(CcdImage::visit)
            .min()
            .ok_or(JointcalError::NoCcdImages)?;

        let n_chip_samples = 2 * chip_order as usize + 4;
        let n_visit_samples = 2 * visit_order as usize + 4;

        // Chips seen by the reference visit map straight to the tangent plane.
        let mut chips = BTreeMap::new();
        for ccd in images.iter().filter(|c| c.visit() == reference_visit) {
            let poly = AstrometryPolynomial::fit(&wcs_samples(ccd, n_chip_samples)?, chip_order)?;
            chips.insert(
                ccd.ccd(),
                SimpleAstrometryMapping::from_input_transform(
                    ccd.bbox(),
                    &AstrometryTransform::Polynomial(poly),
                ),
            );
        }

        let mut visits = BTreeMap::new();
        visits.insert(reference_visit, SimpleAstrometryMapping::identity());

        let visit_ids: BTreeSet<i64> = images.iter().map(CcdImage::visit).collect();
        let mut pending: Vec<i64> = visit_ids
            .into_iter()
            .filter(|v| *v != reference_visit)
            .collect();

        // Each pass fits the visits that share a known chip, then brings in
        // their unknown chips through the visit inverse.
        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for visit in pending {
                let members: Vec<&CcdImage> = images.iter().filter(|c| c.visit() == visit).collect();
                let known: Vec<&CcdImage> = members
                    .iter()
                    .copied()
                    .filter(|c| chips.contains_key(&c.ccd()))
                    .collect();
                if known.is_empty() {
                    still_pending.push(visit);
                    continue;
                }

                let mut mid_points = Vec::new();
                let mut pairs = Vec::new();
                for ccd in &known {
                    let chip: &SimpleAstrometryMapping = &chips[&ccd.ccd()];
                    for (p, tp) in wcs_samples(ccd, n_visit_samples)? {
                        let mid = chip.apply(&p);
                        mid_points.push(mid);
                        pairs.push((mid, tp));
                    }
                }
                let domain = Frame::around(&mid_points).ok_or(JointcalError::NoCcdImages)?;
                let poly = AstrometryPolynomial::fit(&pairs, visit_order)?;
                let visit_mapping = SimpleAstrometryMapping::from_input_transform(
                    &domain,
                    &AstrometryTransform::Polynomial(poly),
                );

                let inverse = visit_mapping.input_transform().inverted(&domain)?;
                let unknown: Vec<&CcdImage> = members
                    .iter()
                    .copied()
                    .filter(|c| !chips.contains_key(&c.ccd()))
                    .collect();
                for ccd in unknown {
                    let samples: Vec<(Point, Point)> = wcs_samples(ccd, n_chip_samples)?
                        .into_iter()
                        .map(|(p, tp)| (p, inverse.apply(&tp)))
                        .collect();
                    let poly = AstrometryPolynomial::fit(&samples, chip_order)?;
                    chips.insert(
                        ccd.ccd(),
                        SimpleAstrometryMapping::from_input_transform(
                            ccd.bbox(),
                            &AstrometryTransform::Polynomial(poly),
                        ),
                    );
                }
                visits.insert(visit, visit_mapping);
                progressed = true;
            }
            if !progressed {
                return Err(JointcalError::PolynomialFit(format!(
                    "visits {still_pending:?} share no detector with the reference visit"
                )));
            }
            pending = still_pending;
        }

        info!(
            "ConstrainedAstrometryModel: {} chips (order {}), {} visits (order {}), reference visit {}",
            chips.len(),
            chip_order,
            visits.len(),
            visit_order,
            reference_visit
        );
        Ok(Self {
            chips,
            visits,
            reference_visit,
            tangent_point,
        })
    }

    pub fn reference_visit(&self) -> i64 {
        self.reference_visit
    }

    pub fn chip_mapping(&self, ccd: i32) -> Option<&SimpleAstrometryMapping> {
        self.chips.get(&ccd)
    }

    pub fn visit_mapping(&self, visit: i64) -> Option<&SimpleAstrometryMapping> {
        self.visits.get(&visit)
    }
}

impl AstrometryModel for ConstrainedAstrometryModel {
    fn mapping(&self, ccd: &CcdImage) -> Result<AstrometryMappingRef<'_>> {
        match (self.chips.get(&ccd.ccd()), self.visits.get(&ccd.visit())) {
            (Some(chip), Some(visit)) => Ok(AstrometryMappingRef::ChipVisit(
                ChipVisitAstrometryMapping::new(chip, visit),
            )),
            _ => Err(JointcalError::MappingNotFound(ccd.key())),
        }
    }

    fn assign_indices(&mut self, components: &FitComponents, first_index: usize) -> usize {
        let mut next = first_index;
        for chip in self.chips.values_mut() {
            assign_leaf(chip, !components.chip, &mut next);
        }
        for (visit, mapping) in self.visits.iter_mut() {
            let fixed = !components.visit || *visit == self.reference_visit;
            assign_leaf(mapping, fixed, &mut next);
        }
        debug!(
            "ConstrainedAstrometryModel: indices {}..{}",
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

    fn make_sky_wcs(&self, ccd: &CcdImage) -> Result<SkyWcs> {
        let AstrometryMappingRef::ChipVisit(cv) = self.mapping(ccd)? else {
            return Err(JointcalError::MappingNotFound(ccd.key()));
        };
        let pixel_to_tp = cv
            .visit()
            .input_transform()
            .compose(&cv.chip().input_transform());
        Ok(SkyWcs::new(self.tangent_point, pixel_to_tp))
    }
}
