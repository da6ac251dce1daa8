//! Photometric fit: scalar residuals in flux (nJy) or AB magnitude.

use nalgebra::DVector;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::associations::Associations;
use crate::ccd_image::CcdImage;
use crate::error::Result;
use crate::model::{FitComponents, PhotometryKind, PhotometryModel};
use crate::star::{FittedStar, FittedStarId, MeasuredStarId, RefStar};

use super::{
    accumulate_1d, check_delta, minimize, Chi2Statistic, Fitter, LeastSquaresProblem,
    MinimizeResult, OutlierCandidate, OutlierTerm, PartialSystem, TripletList,
};

pub struct PhotometryFit<'a, M: PhotometryModel + ?Sized> {
    associations: &'a mut Associations,
    model: &'a mut M,
    components: FitComponents,
    n_par_model: usize,
    n_par_total: usize,
}

/// Residual and its error.
#[derive(Debug, Clone, Copy)]
struct Term {
    residual: f64,
    sigma: f64,
}

impl Term {
    fn new(residual: f64, sigma: f64) -> Option<Self> {
        (residual.is_finite() && sigma.is_finite() && sigma > 0.0).then_some(Self { residual, sigma })
    }

    fn chi2(&self) -> f64 {
        (self.residual / self.sigma).powi(2)
    }
}

impl<'a, M: PhotometryModel + ?Sized> PhotometryFit<'a, M> {
    pub fn new(associations: &'a mut Associations, model: &'a mut M) -> Self {
        info!(
            "PhotometryFit ({:?}): {} images, {} fitted stars",
            model.kind(),
            associations.ccd_images().len(),
            associations.fitted_stars().len()
        );
        Self {
            associations,
            model,
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

    fn star_value(&self, fs: &FittedStar) -> f64 {
        match self.model.kind() {
            PhotometryKind::Flux => fs.flux,
            PhotometryKind::Magnitude => fs.mag,
        }
    }

    fn reference_term(&self, fs: &FittedStar) -> Option<Term> {
        let rs: &RefStar = self.associations.ref_star(fs.ref_star?);
        match self.model.kind() {
            PhotometryKind::Flux => Term::new(fs.flux - rs.flux, rs.flux_err),
            PhotometryKind::Magnitude => Term::new(fs.mag - rs.mag(), rs.mag_err()),
        }
    }

    fn ccd_derivatives(&self, ccd: &CcdImage) -> Result<PartialSystem> {
        let mut out = PartialSystem::default();
        let mapping = self.model.mapping(ccd)?;
        let n_map = mapping.n_par();
        let mut indices = Vec::new();
        let mut h = vec![0.0; n_map + 1];
        let fitted = self.associations.fitted_stars();

        for ms in ccd.catalog_for_fit() {
            let Some(id) = ms.fitted_star() else { continue };
            if !ms.is_valid() {
                continue;
            }
            let fs = &fitted[id.0];
            if n_map == 0 && fs.flux_index.is_none() {
                continue;
            }
            let residual = mapping.transform(ms) - self.star_value(fs);
            let Some(term) = Term::new(residual, mapping.transform_error(ms)) else {
                continue;
            };

            mapping.indices(&mut indices);
            mapping.compute_parameter_derivatives(ms, &mut h[..n_map]);
            let mut n = n_map;
            if let Some(index) = fs.flux_index {
                indices.push(index);
                h[n_map] = -1.0;
                n += 1;
            }
            accumulate_1d(
                &mut out.triplets,
                &mut out.gradient,
                &indices,
                &h[..n],
                term.residual,
                term.sigma,
            );
        }
        Ok(out)
    }

    fn reference_derivatives(&self) -> PartialSystem {
        let mut out = PartialSystem::default();
        for fs in self.associations.fitted_stars() {
            let Some(index) = fs.flux_index else { continue };
            let Some(term) = self.reference_term(fs) else { continue };
            accumulate_1d(
                &mut out.triplets,
                &mut out.gradient,
                &[index],
                &[1.0],
                term.residual,
                term.sigma,
            );
        }
        out
    }

    fn for_each_term(&self, mut f: impl FnMut(Term, OutlierTerm, Vec<usize>)) -> Result<()> {
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
                let residual = mapping.transform(ms) - self.star_value(fs);
                let Some(term) = Term::new(residual, mapping.transform_error(ms)) else {
                    continue;
                };
                let mut indices = map_indices.clone();
                indices.extend(fs.flux_index);
                f(
                    term,
                    OutlierTerm::Measurement(MeasuredStarId { ccd: c, index: i }),
                    indices,
                );
            }
        }
        for (k, fs) in fitted.iter().enumerate() {
            if let Some(term) = self.reference_term(fs) {
                let indices = fs.flux_index.into_iter().collect();
                f(term, OutlierTerm::Reference(FittedStarId(k)), indices);
            }
        }
        Ok(())
    }
}

impl<M: PhotometryModel + ?Sized> LeastSquaresProblem for PhotometryFit<'_, M> {
    fn assign_indices(&mut self, what: &str) -> Result<usize> {
        self.components = FitComponents::photometry(what)?;
        self.n_par_model = self.model.assign_indices(&self.components, 0);
        let mut next = self.n_par_model;
        let fit_fluxes = self.components.stars;
        let kind = self.model.kind();
        let mut undefined = 0;
        for fs in self.associations.fitted_stars_mut() {
            let value = match kind {
                PhotometryKind::Flux => fs.flux,
                PhotometryKind::Magnitude => fs.mag,
            };
            // A star without a usable value has no residuals to constrain it.
            let usable = value.is_finite();
            if fit_fluxes && fs.measurement_count > 0 && !usable {
                undefined += 1;
            }
            fs.flux_index = if fit_fluxes && fs.measurement_count > 0 && usable {
                next += 1;
                Some(next - 1)
            } else {
                None
            };
        }
        if undefined > 0 {
            warn!(
                "PhotometryFit: holding {} fitted stars with an undefined {:?} value fixed",
                undefined, kind
            );
        }
        self.n_par_total = next;
        debug!(
            "PhotometryFit \"{}\": {} mapping and {} flux parameters",
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
        let partials: Vec<Result<PartialSystem>> = self
            .associations
            .ccd_images()
            .par_iter()
            .map(|ccd| self.ccd_derivatives(ccd))
            .collect();
        for partial in partials {
            partial?.merge_into(triplets, gradient);
        }
        if self.components.stars {
            self.reference_derivatives().merge_into(triplets, gradient);
        }
        Ok(())
    }

    fn offset_params(&mut self, delta: &DVector<f64>) -> Result<()> {
        check_delta(delta, self.n_par_total)?;
        self.model.offset_params(delta)?;
        let kind = self.model.kind();
        for fs in self.associations.fitted_stars_mut() {
            if let Some(index) = fs.flux_index {
                match kind {
                    PhotometryKind::Flux => fs.set_flux(fs.flux + delta[index]),
                    PhotometryKind::Magnitude => fs.set_mag(fs.mag + delta[index]),
                }
            }
        }
        Ok(())
    }

    fn compute_chi2(&self) -> Result<Chi2Statistic> {
        let mut chi2 = 0.0;
        let mut n_terms = 0i64;
        self.for_each_term(|term, _, _| {
            chi2 += term.chi2();
            n_terms += 1;
        })?;
        Ok(Chi2Statistic {
            chi2,
            ndof: n_terms - self.n_par_total as i64,
        })
    }

    fn outlier_candidates(&self) -> Result<Vec<OutlierCandidate>> {
        let mut out = Vec::new();
        let fit_fluxes = self.components.stars;
        self.for_each_term(|term, id, indices| {
            if matches!(id, OutlierTerm::Reference(_)) && !fit_fluxes {
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
        for outlier in outliers {
            match *outlier {
                OutlierTerm::Measurement(id) => self.associations.exclude_measurement(id),
                OutlierTerm::Reference(id) => self.associations.exclude_ref_star(id),
            }
        }
        debug!("PhotometryFit: excluded {} terms", outliers.len());
    }
}

impl<M: PhotometryModel + ?Sized> Fitter for PhotometryFit<'_, M> {
    fn minimize(&mut self, what: &str, n_sigma_cut: f64) -> Result<MinimizeResult> {
        minimize(self, what, n_sigma_cut)
    }

    fn compute_chi2(&self) -> Result<Chi2Statistic> {
        LeastSquaresProblem::compute_chi2(self)
    }
}
