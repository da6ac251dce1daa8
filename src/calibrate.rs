//! End-to-end calibration: association, model construction and the staged
//! fit sequence for astrometry and photometry.
//!
//! ```text
//! associate ─► fit_astrometry ─► fit_photometry ─► CalibrationSolution
//! ```
//!
//! Each fit starts with partial steps (one block of parameters at a time)
//! before the joint step with outlier rejection, which keeps the first
//! linearizations close to the starting point.

use anyhow::bail;
use tracing::{error, info, warn};

use crate::associations::Associations;
use crate::fit::{AstrometryFit, Chi2Statistic, Fitter, MinimizeResult, PhotometryFit};
use crate::model::{
    AstrometryModel, ConstrainedAstrometryModel, ConstrainedPhotometryModel, PhotometryKind,
    PhotometryModel, SimpleAstrometryModel, SimplePhotometryModel,
};
use crate::reference::ReferenceCatalog;

/// chi2/ndof above which a converged fit is reported as suspicious.
const BAD_FIT_CHI2_PER_DOF: f64 = 4.0;

/// Structure of the astrometry model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstrometryModelKind {
    /// One polynomial per CCD image.
    Simple,
    /// Per-detector polynomial followed by a per-exposure polynomial.
    Constrained,
}

/// Structure and output quantity of the photometry model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometryModelKind {
    SimpleFlux,
    SimpleMagnitude,
    ConstrainedFlux,
    ConstrainedMagnitude,
}

impl PhotometryModelKind {
    fn kind(self) -> PhotometryKind {
        match self {
            PhotometryModelKind::SimpleFlux | PhotometryModelKind::ConstrainedFlux => {
                PhotometryKind::Flux
            }
            PhotometryModelKind::SimpleMagnitude | PhotometryModelKind::ConstrainedMagnitude => {
                PhotometryKind::Magnitude
            }
        }
    }

    fn is_constrained(self) -> bool {
        matches!(
            self,
            PhotometryModelKind::ConstrainedFlux | PhotometryModelKind::ConstrainedMagnitude
        )
    }
}

/// Configuration for a calibration run.
#[derive(Debug, Clone)]
pub struct CalibrateConfig {
    /// Matching radius between detections, and to the reference catalog
    /// (arcsec). Default 3.0.
    pub match_cut_arcsec: f64,
    /// Minimum number of valid measurements a fitted star needs to be kept.
    /// Default 2.
    pub min_measurements: usize,
    /// Systematic error added in quadrature to centroid errors (pixels).
    /// Default 0.02.
    pub position_error_px: f64,
    /// Default [`AstrometryModelKind::Constrained`].
    pub astrometry_model: AstrometryModelKind,
    /// Polynomial order of the simple astrometry model. Default 3.
    pub astrometry_simple_order: u32,
    /// Polynomial order of the per-detector mappings. Default 1.
    pub astrometry_chip_order: u32,
    /// Polynomial order of the per-exposure mappings. Default 5.
    pub astrometry_visit_order: u32,
    /// Default [`PhotometryModelKind::ConstrainedMagnitude`].
    pub photometry_model: PhotometryModelKind,
    /// Order of the per-exposure photometric polynomial (constrained models)
    /// or of the per-image polynomial (simple models). Default 7.
    pub photometry_visit_order: u32,
    /// Outlier rejection threshold in normalized residual. Default 5.0.
    pub outlier_sigma: f64,
    /// Maximum number of minimize rounds in the final joint fit. Default 20.
    pub max_steps: usize,
    /// Overrides the reference catalog position errors (milliarcsec).
    /// Required when the catalog has no position-error columns.
    pub reference_coordinate_err_mas: Option<f64>,
    /// Epoch the reference catalog is propagated to (decimal year). `None`
    /// uses the mean epoch of the CCD images.
    pub reference_epoch_year: Option<f64>,
    /// Name of the reference flux field (`<field>_flux`, `<field>_fluxErr`).
    pub flux_field: String,
}

impl Default for CalibrateConfig {
    fn default() -> Self {
        Self {
            match_cut_arcsec: 3.0,
            min_measurements: 2,
            position_error_px: 0.02,
            astrometry_model: AstrometryModelKind::Constrained,
            astrometry_simple_order: 3,
            astrometry_chip_order: 1,
            astrometry_visit_order: 5,
            photometry_model: PhotometryModelKind::ConstrainedMagnitude,
            photometry_visit_order: 7,
            outlier_sigma: 5.0,
            max_steps: 20,
            reference_coordinate_err_mas: None,
            reference_epoch_year: None,
            flux_field: "r".to_string(),
        }
    }
}

/// Result of [`fit_astrometry`].
pub struct AstrometryResult {
    pub model: Box<dyn AstrometryModel>,
    pub chi2: Chi2Statistic,
}

/// Result of [`fit_photometry`].
pub struct PhotometryResult {
    pub model: Box<dyn PhotometryModel>,
    pub chi2: Chi2Statistic,
}

/// Associate the images with each other and with `ref_catalog`, and prepare
/// the fitted stars.
///
/// Fails when the association has no images, no fitted stars survive the
/// selection, or no fitted star received a reference star.
pub fn associate(
    associations: &mut Associations,
    ref_catalog: &ReferenceCatalog,
    config: &CalibrateConfig,
    reject_bad_fluxes: bool,
) -> anyhow::Result<()> {
    if associations.ccd_images().is_empty() {
        bail!("No CcdImages to calibrate");
    }
    associations.compute_common_tangent_point()?;
    associations.associate_catalogs(config.match_cut_arcsec, false, true)?;

    let circle = associations.compute_bounding_circle()?;
    info!(
        "Data bounding circle: ra={:.6} dec={:.6} radius={:.4} deg",
        circle.center.ra, circle.center.dec, circle.radius
    );

    let epoch = config.reference_epoch_year.unwrap_or_else(|| {
        let images = associations.ccd_images();
        images.iter().map(|ccd| ccd.epoch()).sum::<f64>() / images.len() as f64
    });
    let ref_catalog = ref_catalog.propagated_to(epoch);
    let n_refs = associations.collect_ref_stars(
        &ref_catalog,
        config.match_cut_arcsec,
        &config.flux_field,
        config.reference_coordinate_err_mas,
        reject_bad_fluxes,
    )?;
    associations.prepare_fitted_stars(config.min_measurements)?;

    let n_images = associations.n_ccd_images_valid_for_fit();
    let n_fitted = associations.fitted_stars().len();
    let n_with_ref = associations.n_fitted_stars_with_associated_ref_star();
    info!(
        "Associated {} CcdImages: {} fitted stars, {} with reference stars ({} matched before selection)",
        n_images, n_fitted, n_with_ref, n_refs
    );
    if n_images == 0 {
        bail!("No CcdImages have measurements left after association");
    }
    if n_fitted == 0 {
        bail!("No fitted stars left after selection");
    }
    if n_with_ref == 0 {
        bail!("No fitted stars are associated with a reference star");
    }
    Ok(())
}

/// Build the astrometry model selected by `config`.
pub fn build_astrometry_model(
    associations: &Associations,
    config: &CalibrateConfig,
) -> anyhow::Result<Box<dyn AstrometryModel>> {
    Ok(match config.astrometry_model {
        AstrometryModelKind::Simple => Box::new(SimpleAstrometryModel::new(
            associations,
            config.astrometry_simple_order,
            0,
        )?),
        AstrometryModelKind::Constrained => Box::new(ConstrainedAstrometryModel::new(
            associations,
            config.astrometry_chip_order,
            config.astrometry_visit_order,
        )?),
    })
}

/// Build the photometry model selected by `config`.
pub fn build_photometry_model(
    associations: &Associations,
    config: &CalibrateConfig,
) -> anyhow::Result<Box<dyn PhotometryModel>> {
    let kind = config.photometry_model.kind();
    Ok(if config.photometry_model.is_constrained() {
        Box::new(ConstrainedPhotometryModel::new(
            associations,
            kind,
            config.photometry_visit_order,
        )?)
    } else {
        Box::new(SimplePhotometryModel::new(
            associations,
            kind,
            config.photometry_visit_order,
        ))
    })
}

/// Compute, log and check the chi2 of `fitter`.
fn log_chi2_and_validate(fitter: &dyn Fitter, label: &str) -> anyhow::Result<Chi2Statistic> {
    let chi2 = fitter.compute_chi2()?;
    info!("{} {}", label, chi2);
    if !chi2.chi2.is_finite() {
        bail!("{}: chi2 is not finite ({})", label, chi2);
    }
    Ok(chi2)
}

/// Run one partial step and fail unless it converged.
fn fit_step(fitter: &mut dyn Fitter, name: &str, what: &str) -> anyhow::Result<Chi2Statistic> {
    match fitter.minimize(what, 0.0)? {
        MinimizeResult::Converged => log_chi2_and_validate(fitter, &format!("{} {}", name, what)),
        other => bail!("{}: fitting {} did not converge ({:?})", name, what, other),
    }
}

/// Fit astrometry: build the model, then fit the mappings, the star
/// positions and finally both together with outlier rejection.
pub fn fit_astrometry(
    associations: &mut Associations,
    config: &CalibrateConfig,
) -> anyhow::Result<AstrometryResult> {
    let mut model = build_astrometry_model(associations, config)?;
    let chi2 = {
        let mut fit = AstrometryFit::new(associations, model.as_mut(), config.position_error_px);
        log_chi2_and_validate(&fit, "Initial astrometry")?;

        if config.astrometry_model == AstrometryModelKind::Constrained {
            fit_step(&mut fit, "astrometry", "DistortionsVisit")?;
        }
        fit_step(&mut fit, "astrometry", "Distortions")?;
        fit.freeze_error_transform();
        fit_step(&mut fit, "astrometry", "Positions")?;

        iterate_fit(
            &mut fit,
            config.max_steps,
            "astrometry",
            "Distortions Positions",
            config.outlier_sigma,
        )?
    };
    Ok(AstrometryResult { model, chi2 })
}

/// Fit photometry: build the model, then fit the model, the star fluxes and
/// finally both together with outlier rejection.
pub fn fit_photometry(
    associations: &mut Associations,
    config: &CalibrateConfig,
) -> anyhow::Result<PhotometryResult> {
    let mut model = build_photometry_model(associations, config)?;
    let chi2 = {
        let mut fit = PhotometryFit::new(associations, model.as_mut());
        log_chi2_and_validate(&fit, "Initial photometry")?;

        if config.photometry_model.is_constrained() {
            fit_step(&mut fit, "photometry", "ModelVisit")?;
        }
        fit_step(&mut fit, "photometry", "Model")?;
        fit_step(&mut fit, "photometry", "Fluxes")?;

        iterate_fit(
            &mut fit,
            config.max_steps,
            "photometry",
            "Model Fluxes",
            config.outlier_sigma,
        )?
    };
    if !model.validate(associations.ccd_images()) {
        bail!("Photometry model is invalid for at least one CcdImage");
    }
    Ok(PhotometryResult { model, chi2 })
}

/// Minimize `what` with outlier rejection until no outliers remain, for at
/// most `max_steps` rounds. Returns the final chi2.
pub fn iterate_fit(
    fitter: &mut dyn Fitter,
    max_steps: usize,
    name: &str,
    what: &str,
    n_sigma: f64,
) -> anyhow::Result<Chi2Statistic> {
    for step in 0..max_steps {
        match fitter.minimize(what, n_sigma)? {
            MinimizeResult::Converged => {
                // One more round with the final set of terms.
                match fitter.minimize(what, n_sigma)? {
                    MinimizeResult::Failed => {
                        bail!("{}: chi2 minimization failure, cannot complete fit", name)
                    }
                    MinimizeResult::NonFinite => bail!("{}: chi2 is not finite", name),
                    _ => {}
                }
                let chi2 = log_chi2_and_validate(fitter, &format!("Fit completed {}", name))?;
                info!("{}: converged after {} steps", name, step + 1);
                if chi2.per_dof() >= BAD_FIT_CHI2_PER_DOF {
                    error!("Potentially bad fit: high chi-squared/ndof ({})", chi2);
                }
                return Ok(chi2);
            }
            MinimizeResult::Chi2Increased => {
                warn!(
                    "{}: still some outliers remaining but chi2 increased, retrying",
                    name
                );
            }
            MinimizeResult::NonFinite => bail!("{}: chi2 is not finite", name),
            MinimizeResult::Failed => {
                bail!("{}: chi2 minimization failure, cannot complete fit", name)
            }
        }
    }
    error!("{} failed to converge after {} steps", name, max_steps);
    log_chi2_and_validate(fitter, &format!("Fit stopped {}", name))
}
