//! Astrometric fit: residuals in the common tangent plane (degrees).
//!
//! Measurement term: `mapping(pixel) − TAN(fitted star)`, with the pixel
//! covariance (plus a floor) propagated through the error transform.
//! Reference term: `TAN(fitted star) − TAN(reference star)`, with the
//! reference position errors propagated through the projection Jacobian.
//! Fitted-star parameters are `(ra, dec)` in degrees.

use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::associations::Associations;
use crate::ccd_image::CcdImage;
use crate::error::Result;
use crate::geom::{tan_project, tan_project_derivative, SkyPoint};
use crate::mapping::AstrometryMappingRef;
use crate::model::{AstrometryModel, FitComponents};
use crate::star::{FittedStar, FittedStarId, MeasuredStar, MeasuredStarId};

use super::{
    accumulate_2d, check_delta, minimize, whitening, Chi2Statistic, Fitter, LeastSquaresProblem,
    MinimizeResult, OutlierCandidate, OutlierTerm, PartialSystem, TripletList,
};

pub struct AstrometryFit<'a, M: AstrometryModel + ?Sized> {
    associations: &'a mut Associations,
    model: &'a mut M,
    /// Added in quadrature to the centroid errors (pixels).
    position_error: f64,
    components: FitComponents,
    n_par_model: usize,
    n_par_total: usize,
}

/// One evaluated residual term.
struct Term {
    residual: Vector2<f64>,
    weight: Matrix2<f64>,
    l: Matrix2<f64>,
}

impl Term {
    fn chi2(&self) -> f64 {
        (self.residual.transpose() * self.weight * self.residual)[(0, 0)]
    }
}

impl<'a, M: AstrometryModel + ?Sized> AstrometryFit<'a, M> {
    pub fn new(associations: &'a mut Associations, model: &'a mut M, position_error_px: f64) -> Self {
        info!(
            "AstrometryFit: {} images, {} fitted stars, {} reference stars",
            associations.ccd_images().len(),
            associations.fitted_stars().len(),
            associations.ref_stars().len()
        );
        Self {
            associations,
            model,
            position_error: position_error_px,
            components: FitComponents::default(),
            n_par_model: 0,
            n_par_total: 0,
        }
    }

    pub fn associations(&self) -> &Associations {
        &*self.associations
    }

    pub fn model(&self) -> &M {
        &*self.model
    }

    /// Freeze the error transforms of the model at their current values.
    pub fn freeze_error_transform(&mut self) {
        self.model.freeze_error_transform();
    }

    fn measurement_term(
        &self,
        mapping: &AstrometryMappingRef<'_>,
        ms: &MeasuredStar,
        fs: &FittedStar,
        tangent: &SkyPoint,
    ) -> Option<Term> {
        let floor = self.position_error * self.position_error;
        let cov = Matrix2::new(ms.vx + floor, ms.vxy, ms.vxy, ms.vy + floor);
        let (tp, tp_cov) = mapping.transform_pos_and_errors(&ms.pixel(), &cov);
        let star = tan_project(&fs.position(), tangent)?;
        let (weight, l) = whitening(&tp_cov)?;
        Some(Term {
            residual: Vector2::new(tp.x - star.x, tp.y - star.y),
            weight,
            l,
        })
    }

    fn reference_term(&self, fs: &FittedStar, tangent: &SkyPoint) -> Option<Term> {
        let rs = self.associations.ref_star(fs.ref_star?);
        let star = tan_project(&fs.position(), tangent)?;
        let reference = tan_project(&rs.position(), tangent)?;
        let d = tan_project_derivative(&rs.position(), tangent)?;
        let cov = d
            * Matrix2::new(rs.ra_err * rs.ra_err, 0.0, 0.0, rs.dec_err * rs.dec_err)
            * d.transpose();
        let (weight, l) = whitening(&cov)?;
        Some(Term {
            residual: Vector2::new(star.x - reference.x, star.y - reference.y),
            weight,
            l,
        })
    }

    /// Free star parameters and `∂TAN/∂(ra, dec)` for `fs`, if its position
    /// is being fitted.
    fn star_derivative(&self, fs: &FittedStar, tangent: &SkyPoint) -> Option<(usize, Matrix2<f64>)> {
        let index = fs.position_index?;
        Some((index, tan_project_derivative(&fs.position(), tangent)?))
    }

    fn ccd_derivatives(&self, ccd: &CcdImage, tangent: &SkyPoint) -> Result<PartialSystem> {
        let mut out = PartialSystem::default();
        let mapping = self.model.mapping(ccd)?;
        let n_map = mapping.n_par();
        let mut map_indices = Vec::new();
        mapping.indices(&mut map_indices);
        let mut h_map = DMatrix::zeros(n_map, 2);
        let fitted = self.associations.fitted_stars();

        for ms in ccd.catalog_for_fit() {
            let Some(id) = ms.fitted_star() else { continue };
            if !ms.is_valid() {
                continue;
            }
            let fs = &fitted[id.0];
            let star = self.star_derivative(fs, tangent);
            if n_map == 0 && star.is_none() {
                continue;
            }
            let Some(term) = self.measurement_term(&mapping, ms, fs, tangent) else {
                continue;
            };
            mapping.compute_transform_and_derivatives(&ms.pixel(), &mut h_map);

            let mut indices = map_indices.clone();
            let mut h = DMatrix::zeros(n_map + 2 * star.is_some() as usize, 2);
            h.view_mut((0, 0), (n_map, 2)).copy_from(&h_map);
            if let Some((index, d)) = star {
                indices.extend([index, index + 1]);
                // r = mapped − TAN(star): ∂r/∂ra and ∂r/∂dec are minus the
                // projection Jacobian columns
                h[(n_map, 0)] = -d[(0, 0)];
                h[(n_map, 1)] = -d[(1, 0)];
                h[(n_map + 1, 0)] = -d[(0, 1)];
                h[(n_map + 1, 1)] = -d[(1, 1)];
            }
            accumulate_2d(
                &mut out.triplets,
                &mut out.gradient,
                &indices,
                &h,
                &term.residual,
                &term.weight,
                &term.l,
            );
        }
        Ok(out)
    }

    fn reference_derivatives(&self, tangent: &SkyPoint) -> PartialSystem {
        let mut out = PartialSystem::default();
        let mut h = DMatrix::zeros(2, 2);
        let mut degenerate = 0;
        for fs in self.associations.fitted_stars() {
            let Some((index, d)) = self.star_derivative(fs, tangent) else { continue };
            let Some(term) = self.reference_term(fs, tangent) else {
                if fs.ref_star.is_some() {
                    degenerate += 1;
                }
                continue;
            };
            h[(0, 0)] = d[(0, 0)];
            h[(0, 1)] = d[(1, 0)];
            h[(1, 0)] = d[(0, 1)];
            h[(1, 1)] = d[(1, 1)];
            accumulate_2d(
                &mut out.triplets,
                &mut out.gradient,
                &[index, index + 1],
                &h,
                &term.residual,
                &term.weight,
                &term.l,
            );
        }
        if degenerate > 0 {
            warn!(
                "AstrometryFit: skipped {} reference terms with a degenerate covariance",
                degenerate
            );
        }
        out
    }

    /// Visit every included term: `f(term, candidate)`.
    fn for_each_term(&self, mut f: impl FnMut(&Term, OutlierTerm, Vec<usize>)) -> Result<()> {
        let tangent = self.associations.common_tangent_point()?;
        let fitted = self.associations.fitted_stars();
        let mut map_indices = Vec::new();
        for (c, ccd) in self.associations.ccd_images().iter().enumerate() {
            let mapping = self.model.mapping(ccd)?;
            mapping.indices(&mut map_indices);
            for (i, ms) in ccd.catalog_for_fit().iter().enumerate() {
                let Some(id) = ms.fitted_star() else { continue };
                if !ms.is_valid() {
                    continue;
                }
                let fs = &fitted[id.0];
                let Some(term) = self.measurement_term(&mapping, ms, fs, &tangent) else {
                    continue;
                };
                let mut indices = map_indices.clone();
                if let Some(index) = fs.position_index {
                    indices.extend([index, index + 1]);
                }
                f(
                    &term,
                    OutlierTerm::Measurement(MeasuredStarId { ccd: c, index: i }),
                    indices,
                );
            }
        }
        for (k, fs) in fitted.iter().enumerate() {
            if let Some(term) = self.reference_term(fs, &tangent) {
                let indices = fs
                    .position_index
                    .map(|index| vec![index, index + 1])
                    .unwrap_or_default();
                f(&term, OutlierTerm::Reference(FittedStarId(k)), indices);
            }
        }
        Ok(())
    }
}

impl<M: AstrometryModel + ?Sized> LeastSquaresProblem for AstrometryFit<'_, M> {
    fn assign_indices(&mut self, what: &str) -> Result<usize> {
        self.components = FitComponents::astrometry(what)?;
        self.n_par_model = self.model.assign_indices(&self.components, 0);
        let mut next = self.n_par_model;
        let fit_positions = self.components.stars;
        for fs in self.associations.fitted_stars_mut() {
            fs.position_index = if fit_positions && fs.measurement_count > 0 {
                let index = next;
                next += 2;
                Some(index)
            } else {
                None
            };
        }
        self.n_par_total = next;
        debug!(
            "AstrometryFit \"{}\": {} mapping and {} position parameters",
            what,
            self.n_par_model,
            self.n_par_total - self.n_par_model
        );
        Ok(self.n_par_total)
    }

    fn n_par_total(&self) -> usize {
        self.n_par_total
    }

    fn ls_derivatives(&self, triplets: &mut TripletList, gradient: &mut DVector<f64>) -> Result<()> {
        let tangent = self.associations.common_tangent_point()?;
        let partials: Vec<Result<PartialSystem>> = self
            .associations
            .ccd_images()
            .par_iter()
            .map(|ccd| self.ccd_derivatives(ccd, &tangent))
            .collect();
        for partial in partials {
            partial?.merge_into(triplets, gradient);
        }
        if self.components.stars {
            self.reference_derivatives(&tangent)
                .merge_into(triplets, gradient);
        }
        Ok(())
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()> {
        check_delta(delta, self.n_par_total)?;
        self.model.offset_params(delta)?;
        for fs in self.associations.fitted_stars_mut() {
            if let Some(index) = fs.position_index {
                let moved = SkyPoint::new(fs.ra + delta[index], fs.dec + delta[index + 1]);
                fs.set_position(moved);
            }
        }
        Ok(())
    }

    fn compute_chi2(&self) -> Result<Chi2Statistic> {
        let mut chi2 = 0.0;
        let mut n_terms = 0i64;
        self.for_each_term(|term, _, _| {
            chi2 += term.chi2();
            n_terms += 2;
        })?;
        Ok(Chi2Statistic {
            chi2,
            ndof: n_terms - self.n_par_total as i64,
        })
    }

    fn outlier_candidates(&self) -> Result<Vec<OutlierCandidate>> {
        let mut out = Vec::new();
        let fit_positions = self.components.stars;
        self.for_each_term(|term, id, indices| {
            // A reference term only moves when positions are fitted
            if matches!(id, OutlierTerm::Reference(_)) && !fit_positions {
                return;
            }
            out.push(OutlierCandidate {
                term: id,
                chi2: term.chi2(),
                indices,
            });
        })?;
        Ok(out)
    }

    fn remove_outliers(&mut self, outliers: &[OutlierTerm]) {
        let mut n_meas = 0;
        let mut n_ref = 0;
        for outlier in outliers {
            match *outlier {
                OutlierTerm::Measurement(id) => {
                    self.associations.exclude_measurement(id);
                    n_meas += 1;
                }
                OutlierTerm::Reference(id) => {
                    self.associations.exclude_ref_star(id);
                    n_ref += 1;
                }
            }
        }
        debug!(
            "AstrometryFit: excluded {} measurements and {} reference terms",
            n_meas, n_ref
        );
    }
}

impl<M: AstrometryModel + ?Sized> Fitter for AstrometryFit<'_, M> {
    fn minimize(&mut self, what: &str, n_sigma_cut: f64) -> Result<MinimizeResult> {
        minimize(self, what, n_sigma_cut)
    }

    fn compute_chi2(&self) -> Result<Chi2Statistic> {
        LeastSquaresProblem::compute_chi2(self)
    }
}
