//! Cross-identification of detections across CCD images.
//!
//! [`Associations`] owns every [`CcdImage`], the merged list of
//! [`FittedStar`]s and the [`RefStar`]s, plus the common tangent point all
//! matching happens in. A calibration run goes through it in this order:
//!
//! 1. add the images and compute (or set) the common tangent point,
//! 2. [`associate_catalogs`](Associations::associate_catalogs),
//! 3. [`collect_ref_stars`](Associations::collect_ref_stars),
//! 4. [`prepare_fitted_stars`](Associations::prepare_fitted_stars).
//!
//! Matching is greedy and incremental over the image list: each image is
//! matched against the fitted stars created by the images before it, so the
//! merged list can depend on image order.

use std::collections::{BTreeSet, HashMap};

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::ccd_image::{CcdImage, CcdImageMetadata, DetectionRecord};
use crate::error::{JointcalError, Result};
use crate::finder::StarFinder;
use crate::geom::{
    angular_separation, enclosing_circle, tan_deproject, tan_project, uvec_to_radec, Point,
    SkyCircle, SkyPoint,
};
use crate::reference::ReferenceCatalog;
use crate::star::{
    link_fitted_star, unlink_fitted_star, FittedStar, FittedStarId, MeasuredStar, MeasuredStarId,
    RefStar, RefStarId,
};
use crate::transform::SkyWcs;

const ARCSEC_PER_DEG: f64 = 3600.0;
const MAS_PER_DEG: f64 = 3_600_000.0;

/// Owner of the images, the fitted-star arena and the reference stars.
///
/// Not `Clone`: one instance coordinates one calibration run, and every
/// component mutates it through `&mut`.
#[derive(Debug, Default)]
pub struct Associations {
    ccd_images: Vec<CcdImage>,
    fitted_stars: Vec<FittedStar>,
    ref_stars: Vec<RefStar>,
    common_tangent_point: Option<SkyPoint>,
    fitted_stars_selected: bool,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ccd_images(ccd_images: Vec<CcdImage>) -> Self {
        Self {
            ccd_images,
            ..Self::default()
        }
    }

    // ── Images ──

    /// Build a [`CcdImage`] from raw inputs and append it.
    pub fn create_ccd_image(
        &mut self,
        records: &[DetectionRecord],
        wcs: SkyWcs,
        metadata: CcdImageMetadata,
    ) -> &CcdImage {
        self.add_ccd_image(CcdImage::new(records, wcs, metadata))
    }

    pub fn add_ccd_image(&mut self, mut image: CcdImage) -> &CcdImage {
        if let Some(tp) = self.common_tangent_point {
            image.set_common_tangent_point(tp);
        }
        self.ccd_images.push(image);
        &self.ccd_images[self.ccd_images.len() - 1]
    }

    pub fn ccd_images(&self) -> &[CcdImage] {
        &self.ccd_images
    }

    pub fn fitted_stars(&self) -> &[FittedStar] {
        &self.fitted_stars
    }

    pub fn fitted_stars_mut(&mut self) -> &mut [FittedStar] {
        &mut self.fitted_stars
    }

    pub fn ref_stars(&self) -> &[RefStar] {
        &self.ref_stars
    }

    pub fn ref_star(&self, id: RefStarId) -> &RefStar {
        &self.ref_stars[id.0]
    }

    // ── Tangent point ──

    /// Set the common tangent point to the mean of the image sky centers.
    pub fn compute_common_tangent_point(&mut self) -> Result<SkyPoint> {
        if self.ccd_images.is_empty() {
            return Err(JointcalError::NoCcdImages);
        }
        let sum: Vector3<f64> = self
            .ccd_images
            .iter()
            .map(|ccd| ccd.sky_center().uvec())
            .sum();
        let tangent = uvec_to_radec(&sum.normalize());
        info!(
            "Common tangent point: ra={:.6} dec={:.6}",
            tangent.ra, tangent.dec
        );
        self.set_common_tangent_point(tangent);
        Ok(tangent)
    }

    pub fn set_common_tangent_point(&mut self, tangent: SkyPoint) {
        self.common_tangent_point = Some(tangent);
        for ccd in &mut self.ccd_images {
            ccd.set_common_tangent_point(tangent);
        }
    }

    pub fn common_tangent_point(&self) -> Result<SkyPoint> {
        self.common_tangent_point
            .ok_or(JointcalError::TangentPointNotSet)
    }

    // ── Matching ──

    /// Merge the detections of every image into the fitted-star list.
    ///
    /// Each detection is matched to the fitted star at the smallest angular
    /// separation among those within `match_cut_arcsec` in the common tangent
    /// plane; when several detections of one image claim the same fitted star,
    /// only the closest keeps it. Unmatched detections become new fitted stars when
    /// `enlarge_fitted_list` is set and stay out of the fit otherwise. A cut
    /// of zero or less disables matching.
    ///
    /// With `use_fitted_list` the existing fitted stars are kept (their
    /// counts and reference links are reset); otherwise the list is rebuilt
    /// from scratch.
    pub fn associate_catalogs(
        &mut self,
        match_cut_arcsec: f64,
        use_fitted_list: bool,
        enlarge_fitted_list: bool,
    ) -> Result<()> {
        let tangent = self.common_tangent_point()?;
        let cut = match_cut_arcsec / ARCSEC_PER_DEG;
        self.fitted_stars_selected = false;

        for fs in &mut self.fitted_stars {
            fs.clear_before_association();
        }
        if !use_fitted_list {
            self.fitted_stars.clear();
        }

        let mut n_matched = 0usize;
        let mut n_created = 0usize;
        for ccd in &mut self.ccd_images {
            ccd.reset_catalog_for_fit();

            let mut projected = Vec::with_capacity(ccd.catalog_for_fit().len());
            for ms in ccd.catalog_for_fit() {
                projected.push(ccd.pixel_to_common_tangent_plane(&ms.pixel()).ok());
            }

            let matches = if cut > 0.0 && !self.fitted_stars.is_empty() {
                let finder = StarFinder::new(fitted_tangent_plane(&self.fitted_stars, &tangent), cut);
                let fitted = &self.fitted_stars;
                let candidates: Vec<Option<(usize, f64)>> = projected
                    .iter()
                    .map(|tp| {
                        let p = (*tp)?;
                        let sky = tan_deproject(&p, &tangent);
                        finder.nearest_by(&p, cut, |k| {
                            angular_separation(&sky, &fitted[k].position())
                        })
                    })
                    .collect();
                keep_closest_claims(candidates)
            } else {
                vec![None; projected.len()]
            };

            let name = ccd.name().to_string();
            let catalog = ccd.catalog_for_fit_mut();
            for (i, ms) in catalog.iter_mut().enumerate() {
                match (matches[i], projected[i]) {
                    (Some(fitted), _) => {
                        link_fitted_star(ms, &mut self.fitted_stars, FittedStarId(fitted));
                        n_matched += 1;
                    }
                    (None, Some(tp)) if enlarge_fitted_list => {
                        let id = FittedStarId(self.fitted_stars.len());
                        self.fitted_stars
                            .push(FittedStar::new(tan_deproject(&tp, &tangent), ms.flux));
                        link_fitted_star(ms, &mut self.fitted_stars, id);
                        n_created += 1;
                    }
                    (None, None) => {
                        warn!("CcdImage {}: detection {} is not projectable", name, ms.id);
                        ms.set_valid(false);
                    }
                    (None, Some(_)) => {}
                }
            }
            debug!(
                "Associated image {}: {} fitted stars so far",
                ccd.name(),
                self.fitted_stars.len()
            );
        }

        info!(
            "Associated {} detections with existing fitted stars, created {} new ones ({} total)",
            n_matched,
            n_created,
            self.fitted_stars.len()
        );
        Ok(())
    }

    /// Attach reference stars to fitted stars.
    ///
    /// `ref_coordinate_err_mas` overrides the catalog position errors; without
    /// it the catalog must carry `ra_err` and `dec_err` columns.
    /// `reject_bad_fluxes` drops references with a non-finite or zero flux or
    /// flux error before matching. Returns the number of fitted stars that
    /// received a reference.
    pub fn collect_ref_stars(
        &mut self,
        ref_catalog: &ReferenceCatalog,
        match_cut_arcsec: f64,
        flux_field: &str,
        ref_coordinate_err_mas: Option<f64>,
        reject_bad_fluxes: bool,
    ) -> Result<usize> {
        let tangent = self.common_tangent_point()?;
        let cut = match_cut_arcsec / ARCSEC_PER_DEG;

        let mut ref_stars = ref_catalog.ref_stars(flux_field)?;
        if let Some(err_mas) = ref_coordinate_err_mas {
            let err = err_mas / MAS_PER_DEG;
            for rs in &mut ref_stars {
                rs.dec_err = err;
                rs.ra_err = err / rs.dec.to_radians().cos();
            }
        } else if ref_catalog.ra_err.is_none() {
            return Err(JointcalError::MissingReferenceField("ra_err".to_string()));
        } else if ref_catalog.dec_err.is_none() {
            return Err(JointcalError::MissingReferenceField("dec_err".to_string()));
        }
        let no_position_error = ref_stars
            .iter()
            .filter(|rs| !(rs.ra_err > 0.0 && rs.dec_err > 0.0))
            .count();
        if no_position_error > 0 {
            warn!(
                "{} reference stars have no usable position error and cannot constrain astrometry",
                no_position_error
            );
        }
        if reject_bad_fluxes {
            let before = ref_stars.len();
            ref_stars.retain(|rs| {
                rs.flux.is_finite() && rs.flux != 0.0 && rs.flux_err.is_finite() && rs.flux_err != 0.0
            });
            if ref_stars.len() < before {
                info!(
                    "Rejected {} reference stars with bad fluxes",
                    before - ref_stars.len()
                );
            }
        }

        for fs in &mut self.fitted_stars {
            fs.ref_star = None;
        }

        let mut n_linked = 0;
        if cut > 0.0 && !self.fitted_stars.is_empty() {
            let finder = StarFinder::new(fitted_tangent_plane(&self.fitted_stars, &tangent), cut);
            let candidates: Vec<Option<(usize, f64)>> = ref_stars
                .iter()
                .map(|rs| {
                    let sky = rs.position();
                    let p = tan_project(&sky, &tangent)?;
                    finder.nearest_by(&p, cut, |k| {
                        angular_separation(&sky, &self.fitted_stars[k].position())
                    })
                })
                .collect();
            for (r, fitted) in keep_closest_claims(candidates).into_iter().enumerate() {
                if let Some(fitted) = fitted {
                    self.fitted_stars[fitted].ref_star = Some(RefStarId(r));
                    n_linked += 1;
                }
            }
        }

        info!(
            "Collected {} reference stars, {} associated with fitted stars",
            ref_stars.len(),
            n_linked
        );
        self.ref_stars = ref_stars;
        Ok(n_linked)
    }

    // ── Fitted-star preparation ──

    /// [`select_fitted_stars`](Self::select_fitted_stars) followed by
    /// [`normalize_fitted_stars`](Self::normalize_fitted_stars).
    pub fn prepare_fitted_stars(&mut self, min_measurements: usize) -> Result<()> {
        self.select_fitted_stars(min_measurements);
        self.normalize_fitted_stars()
    }

    /// Drop fitted stars with fewer than `min_measurements` detections.
    ///
    /// Their detections are unlinked and marked invalid, and the arena is
    /// compacted. Returns the number of fitted stars removed.
    pub fn select_fitted_stars(&mut self, min_measurements: usize) -> usize {
        let doomed: Vec<bool> = self
            .fitted_stars
            .iter()
            .map(|fs| fs.measurement_count < min_measurements)
            .collect();

        for ccd in &mut self.ccd_images {
            for ms in ccd.catalog_for_fit_mut() {
                if let Some(id) = ms.fitted_star() {
                    if doomed[id.0] {
                        unlink_fitted_star(ms, &mut self.fitted_stars);
                        ms.set_valid(false);
                    }
                }
            }
        }

        let mut remap = vec![None; self.fitted_stars.len()];
        let mut kept = Vec::with_capacity(self.fitted_stars.len());
        for (old, fs) in std::mem::take(&mut self.fitted_stars).into_iter().enumerate() {
            if !doomed[old] {
                remap[old] = Some(kept.len());
                kept.push(fs);
            }
        }
        let removed = remap.len() - kept.len();
        self.fitted_stars = kept;
        for ccd in &mut self.ccd_images {
            for ms in ccd.catalog_for_fit_mut() {
                ms.remap_fitted_star(&remap);
            }
        }

        self.fitted_stars_selected = true;
        info!(
            "Selected {} fitted stars with at least {} measurements ({} removed)",
            self.fitted_stars.len(),
            min_measurements,
            removed
        );
        removed
    }

    /// Replace each fitted star's position and flux by the arithmetic mean
    /// over its linked valid detections.
    ///
    /// Fails unless [`select_fitted_stars`](Self::select_fitted_stars) ran
    /// after the last association, since the averages depend on the final
    /// membership.
    pub fn normalize_fitted_stars(&mut self) -> Result<()> {
        if !self.fitted_stars_selected {
            return Err(JointcalError::FittedStarsNotSelected);
        }

        // (Σ Δra, Σ dec, Σ flux, n) per fitted star
        let mut sums = vec![(0.0, 0.0, 0.0, 0usize); self.fitted_stars.len()];
        for ccd in &self.ccd_images {
            for ms in ccd.catalog_for_fit() {
                let Some(id) = ms.fitted_star() else { continue };
                if !ms.is_valid() {
                    continue;
                }
                let sky = ccd.wcs().pixel_to_sky(&ms.pixel());
                let base = self.fitted_stars[id.0].ra;
                let entry = &mut sums[id.0];
                entry.0 += wrap_degrees(sky.ra - base);
                entry.1 += sky.dec;
                entry.2 += ms.flux;
                entry.3 += 1;
            }
        }

        for (fs, (dra, dec, flux, n)) in self.fitted_stars.iter_mut().zip(sums) {
            if n == 0 {
                continue;
            }
            let n = n as f64;
            fs.set_position(SkyPoint::new(fs.ra + dra / n, dec / n));
            fs.set_flux(flux / n);
        }
        debug!("Normalized {} fitted stars", self.fitted_stars.len());
        Ok(())
    }

    // ── Derived quantities ──

    /// Smallest sky circle containing every image's bounding-box corners.
    pub fn compute_bounding_circle(&self) -> Result<SkyCircle> {
        let tangent = self.common_tangent_point()?;
        if self.ccd_images.is_empty() {
            return Err(JointcalError::NoCcdImages);
        }

        let mut corners_tp = Vec::with_capacity(4 * self.ccd_images.len());
        let mut corners_sky = Vec::with_capacity(4 * self.ccd_images.len());
        for ccd in &self.ccd_images {
            for corner in ccd.bbox().corners() {
                corners_tp.push(ccd.pixel_to_common_tangent_plane(&corner)?);
                corners_sky.push(ccd.wcs().pixel_to_sky(&corner));
            }
        }

        let (center_tp, _) = enclosing_circle(&corners_tp).ok_or(JointcalError::NoCcdImages)?;
        let center = tan_deproject(&center_tp, &tangent);
        let radius = corners_sky
            .iter()
            .map(|c| angular_separation(&center, c))
            .fold(0.0, f64::max);

        info!(
            "Bounding circle: ra={:.6} dec={:.6} radius={:.4} deg",
            center.ra, center.dec, radius
        );
        Ok(SkyCircle { center, radius })
    }

    // ── Queries ──

    /// Images with at least one valid detection linked to a fitted star.
    pub fn n_ccd_images_valid_for_fit(&self) -> usize {
        self.ccd_images
            .iter()
            .filter(|ccd| ccd.count_valid_stars() > 0)
            .count()
    }

    pub fn n_fitted_stars_with_associated_ref_star(&self) -> usize {
        self.fitted_stars
            .iter()
            .filter(|fs| fs.ref_star.is_some())
            .count()
    }

    /// Number of distinct filters among the images.
    pub fn n_filters(&self) -> usize {
        self.ccd_images
            .iter()
            .map(|ccd| ccd.filter())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn measured_star(&self, id: MeasuredStarId) -> &MeasuredStar {
        &self.ccd_images[id.ccd].catalog_for_fit()[id.index]
    }

    /// Detections currently linked to `fitted`.
    pub fn measurements_of(&self, fitted: FittedStarId) -> Vec<MeasuredStarId> {
        let mut out = Vec::new();
        for (c, ccd) in self.ccd_images.iter().enumerate() {
            for (i, ms) in ccd.catalog_for_fit().iter().enumerate() {
                if ms.fitted_star() == Some(fitted) {
                    out.push(MeasuredStarId { ccd: c, index: i });
                }
            }
        }
        out
    }

    // ── Fit support ──

    /// Invalidate a detection and release it from its fitted star.
    pub fn exclude_measurement(&mut self, id: MeasuredStarId) {
        let ms = &mut self.ccd_images[id.ccd].catalog_for_fit_mut()[id.index];
        ms.set_valid(false);
        unlink_fitted_star(ms, &mut self.fitted_stars);
    }

    /// Detach the reference star of `fitted`.
    pub fn exclude_ref_star(&mut self, fitted: FittedStarId) {
        self.fitted_stars[fitted.0].ref_star = None;
    }
}

/// Tangent-plane positions of the fitted stars; unprojectable ones become NaN
/// so the finder skips them while keeping indices aligned.
fn fitted_tangent_plane(fitted: &[FittedStar], tangent: &SkyPoint) -> Vec<Point> {
    fitted
        .iter()
        .map(|fs| tan_project(&fs.position(), tangent).unwrap_or(Point::new(f64::NAN, f64::NAN)))
        .collect()
}

/// Resolve candidates that claim the same target: the closest claimant keeps
/// it (lower index on ties), the others become unmatched.
fn keep_closest_claims(candidates: Vec<Option<(usize, f64)>>) -> Vec<Option<usize>> {
    let mut owner: HashMap<usize, (usize, f64)> = HashMap::new();
    for (i, cand) in candidates.iter().enumerate() {
        if let Some((target, d)) = *cand {
            match owner.get(&target) {
                Some(&(_, best)) if best <= d => {}
                _ => {
                    owner.insert(target, (i, d));
                }
            }
        }
    }
    candidates
        .iter()
        .enumerate()
        .map(|(i, cand)| {
            cand.and_then(|(target, _)| match owner.get(&target) {
                Some(&(winner, _)) if winner == i => Some(target),
                _ => None,
            })
        })
        .collect()
}

fn wrap_degrees(d: f64) -> f64 {
    let w = d.rem_euclid(360.0);
    if w > 180.0 {
        w - 360.0
    } else {
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_closest_claims() {
        let resolved = keep_closest_claims(vec![
            Some((0, 0.5)),
            Some((0, 0.2)),
            None,
            Some((1, 0.1)),
            Some((0, 0.2)),
        ]);
        assert_eq!(resolved, vec![None, Some(0), None, Some(1), None]);
    }

    #[test]
    fn test_wrap_degrees() {
        assert_eq!(wrap_degrees(359.0), -1.0);
        assert_eq!(wrap_degrees(-359.0), 1.0);
        assert_eq!(wrap_degrees(10.0), 10.0);
    }

    #[test]
    fn test_normalize_requires_selection() {
        let mut assoc = Associations::new();
        assert_eq!(
            assoc.normalize_fitted_stars(),
            Err(JointcalError::FittedStarsNotSelected)
        );
        assoc.select_fitted_stars(2);
        assert_eq!(assoc.normalize_fitted_stars(), Ok(()));
    }

    #[test]
    fn test_tangent_point_required() {
        let mut assoc = Associations::new();
        assert_eq!(
            assoc.associate_catalogs(1.0, false, true),
            Err(JointcalError::TangentPointNotSet)
        );
        assert_eq!(
            assoc.compute_common_tangent_point(),
            Err(JointcalError::NoCcdImages)
        );
    }
}
