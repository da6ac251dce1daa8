//! Least-squares fits on synthetic fields: parameter bookkeeping, exact
//! recovery in one step, and outlier rejection.

mod synthetic;

use jointcal::fit::{AstrometryFit, Fitter, LeastSquaresProblem, MinimizeResult, PhotometryFit};
use jointcal::model::{
    AstrometryModel, ConstrainedAstrometryModel, PhotometryKind, PhotometryModel,
    SimpleAstrometryModel, SimplePhotometryModel,
};
use jointcal::{Associations, FittedStarId, JointcalError};
use nalgebra::DVector;
use synthetic::{field_center, generate, FieldConfig, Truth, FLUX_FIELD};

/// Associate at 3 arcsec about the true field center and keep stars seen at
/// least twice.
fn associated(config: &FieldConfig) -> (Associations, Truth) {
    synthetic::init_tracing();
    let (mut assoc, truth) = generate(config);
    assoc.set_common_tangent_point(field_center());
    assoc.associate_catalogs(3.0, false, true).unwrap();
    assoc.prepare_fitted_stars(2).unwrap();
    (assoc, truth)
}

/// Move every fitted star onto the true star it was built from.
fn pin_fitted_stars_to_truth(assoc: &mut Associations, truth: &Truth) {
    for k in 0..assoc.fitted_stars().len() {
        let first = assoc.measurements_of(FittedStarId(k))[0];
        let star = truth.star(assoc.measured_star(first).id).clone();
        let fs = &mut assoc.fitted_stars_mut()[k];
        fs.set_position(star.sky);
        fs.set_flux(star.flux);
    }
}

#[test]
fn test_assign_indices_gives_contiguous_blocks() {
    let (mut assoc, _) = associated(&FieldConfig::default());
    let n_images = assoc.ccd_images().len();
    let n_stars = assoc.fitted_stars().len();
    let keys: Vec<_> = assoc.ccd_images().iter().map(|c| c.key()).collect();
    let mut model = SimpleAstrometryModel::new(&assoc, 2, 0).unwrap();
    assert_eq!(model.total_parameters(), n_images * 12);

    {
        let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.02);
        assert_eq!(
            LeastSquaresProblem::assign_indices(&mut fit, "Distortions").unwrap(),
            n_images * 12
        );
        assert_eq!(
            LeastSquaresProblem::assign_indices(&mut fit, "Positions").unwrap(),
            2 * n_stars
        );
        assert_eq!(
            LeastSquaresProblem::assign_indices(&mut fit, "Distortions Positions").unwrap(),
            n_images * 12 + 2 * n_stars
        );
        assert_eq!(
            LeastSquaresProblem::assign_indices(&mut fit, "Distortions Colors"),
            Err(JointcalError::UnknownFitComponent("Colors".to_string()))
        );
        LeastSquaresProblem::assign_indices(&mut fit, "Distortions Positions").unwrap();
    }

    let mut starts: Vec<usize> = keys
        .iter()
        .map(|k| model.mapping_for(k).unwrap().index().unwrap())
        .collect();
    starts.sort_unstable();
    let expected: Vec<usize> = (0..n_images).map(|i| 12 * i).collect();
    assert_eq!(starts, expected);

    let mut positions: Vec<usize> = assoc
        .fitted_stars()
        .iter()
        .map(|fs| fs.position_index.unwrap())
        .collect();
    positions.sort_unstable();
    let expected: Vec<usize> = (0..n_stars).map(|k| n_images * 12 + 2 * k).collect();
    assert_eq!(positions, expected);
}

#[test]
fn test_constrained_model_holds_reference_visit_fixed() {
    let (mut assoc, _) = associated(&FieldConfig::default());
    let mut model = ConstrainedAstrometryModel::new(&assoc, 1, 2).unwrap();
    let reference = model.reference_visit();
    assert_eq!(reference, 1000);

    let n = {
        let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.02);
        LeastSquaresProblem::assign_indices(&mut fit, "Distortions").unwrap()
    };
    // 2 chips of order 1 and 2 free visits of order 2
    assert_eq!(n, 2 * 6 + 2 * 12);
    assert!(model.visit_mapping(reference).unwrap().index().is_none());
    assert!(model.visit_mapping(1001).unwrap().index().is_some());
    assert!(model.chip_mapping(10).unwrap().index().is_some());

    let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.02);
    assert_eq!(
        LeastSquaresProblem::assign_indices(&mut fit, "DistortionsVisit").unwrap(),
        2 * 12
    );
}

#[test]
fn test_noiseless_distortions_converge_in_one_step() {
    let (mut assoc, truth) = associated(&FieldConfig::noiseless());
    pin_fitted_stars_to_truth(&mut assoc, &truth);
    let mut model = SimpleAstrometryModel::new(&assoc, 1, 0).unwrap();

    {
        let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.0);
        let before = Fitter::compute_chi2(&fit).unwrap();
        assert_eq!(fit.minimize("Distortions", 0.0), Ok(MinimizeResult::Converged));
        let after = Fitter::compute_chi2(&fit).unwrap();
        println!("before {} / after {}", before, after);
        assert!(before.chi2 > 1e3);
        assert!(after.chi2 < 1e-6);
    }

    let mut max_err: f64 = 0.0;
    for ccd in assoc.ccd_images() {
        let wcs = model.make_sky_wcs(ccd).unwrap();
        let expected = &truth.image(ccd.key()).pixel_to_tp;
        for p in ccd.bbox().grid(5) {
            let got = wcs.pixel_to_tangent_plane().apply(&p);
            max_err = max_err.max(got.distance(&expected.apply(&p)));
        }
    }
    println!("max tangent-plane error {:.3e} deg", max_err);
    assert!(max_err < 1e-9);
}

#[test]
fn test_outlier_is_rejected() {
    let config = FieldConfig {
        outlier_offset_px: 100.0 * 0.02,
        ..FieldConfig::default()
    };
    synthetic::init_tracing();
    let (mut assoc, truth) = generate(&config);
    assoc.set_common_tangent_point(field_center());
    assoc.associate_catalogs(3.0, false, true).unwrap();
    assoc
        .collect_ref_stars(&truth.reference_catalog(), 3.0, FLUX_FIELD, Some(5.0), true)
        .unwrap();
    assoc.prepare_fitted_stars(2).unwrap();
    let mut model = SimpleAstrometryModel::new(&assoc, 1, 0).unwrap();

    let chi2 = {
        let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.0);
        assert_eq!(
            fit.minimize("Distortions", 0.0),
            Ok(MinimizeResult::Converged)
        );
        assert_eq!(
            fit.minimize("Distortions Positions", 5.0),
            Ok(MinimizeResult::Converged)
        );
        Fitter::compute_chi2(&fit).unwrap()
    };
    println!("after rejection: {}", chi2);
    assert!(chi2.per_dof() > 0.5 && chi2.per_dof() < 1.5);

    let (key, star_id) = truth.outlier.unwrap();
    let ccd = assoc
        .ccd_images()
        .iter()
        .find(|c| c.key() == key)
        .unwrap();
    let ms = ccd
        .catalog_for_fit()
        .iter()
        .find(|ms| ms.id == star_id)
        .unwrap();
    assert!(!ms.is_valid());
    assert!(ms.fitted_star().is_none());

    // Nothing else went: every other detection still linked is valid.
    let invalid_linked = assoc
        .ccd_images()
        .iter()
        .flat_map(|c| c.catalog_for_fit())
        .filter(|ms| ms.fitted_star().is_some() && !ms.is_valid())
        .count();
    assert_eq!(invalid_linked, 0);
}

#[test]
fn test_star_without_magnitude_is_held_fixed() {
    let (mut assoc, truth) = associated(&FieldConfig::noiseless());
    pin_fitted_stars_to_truth(&mut assoc, &truth);
    let mut model = SimplePhotometryModel::new(&assoc, PhotometryKind::Magnitude, 0);
    {
        let mut fit = PhotometryFit::new(&mut assoc, &mut model);
        assert_eq!(fit.minimize("Model", 0.0), Ok(MinimizeResult::Converged));
    }

    // A non-positive flux has no magnitude.
    assoc.fitted_stars_mut()[0].set_flux(-1.0);
    assert!(assoc.fitted_stars()[0].mag.is_nan());
    let n_stars = assoc.fitted_stars().len();
    {
        let mut fit = PhotometryFit::new(&mut assoc, &mut model);
        assert_eq!(
            LeastSquaresProblem::assign_indices(&mut fit, "Fluxes").unwrap(),
            n_stars - 1
        );
        assert_eq!(fit.minimize("Fluxes", 0.0), Ok(MinimizeResult::Converged));
    }

    let bad = &assoc.fitted_stars()[0];
    assert!(bad.flux_index.is_none());
    assert_eq!(bad.flux, -1.0);
    for k in 1..n_stars {
        let fs = &assoc.fitted_stars()[k];
        assert!(fs.flux_index.is_some());
        let first = assoc.measurements_of(FittedStarId(k))[0];
        let expected = truth.star(assoc.measured_star(first).id).flux;
        assert!(((fs.flux - expected) / expected).abs() < 1e-9);
    }
}

#[test]
fn test_offset_params_checks_length() {
    let (mut assoc, _) = associated(&FieldConfig::default());
    let mut model = SimpleAstrometryModel::new(&assoc, 1, 0).unwrap();
    let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.02);
    let n = LeastSquaresProblem::assign_indices(&mut fit, "Distortions").unwrap();
    assert_eq!(
        LeastSquaresProblem::offset_params(&mut fit, &DVector::zeros(n + 1)),
        Err(JointcalError::SizeMismatch {
            expected: n,
            got: n + 1
        })
    );
    assert_eq!(
        LeastSquaresProblem::offset_params(&mut fit, &DVector::zeros(n)),
        Ok(())
    );
}

#[test]
fn test_all_mappings_held_fixed_is_nothing_to_fit() {
    let (mut assoc, _) = associated(&FieldConfig::default());
    let n_images = assoc.ccd_images().len();
    let mut model = SimpleAstrometryModel::new(&assoc, 1, n_images).unwrap();
    let mut fit = AstrometryFit::new(&mut assoc, &mut model, 0.02);
    assert_eq!(
        fit.minimize("Distortions", 0.0),
        Err(JointcalError::NothingToFit("Distortions".to_string()))
    );
}

#[test]
fn test_noiseless_photometry_recovers_calibration() {
    for kind in [PhotometryKind::Flux, PhotometryKind::Magnitude] {
        let (mut assoc, truth) = associated(&FieldConfig::noiseless());
        pin_fitted_stars_to_truth(&mut assoc, &truth);
        let mut model = SimplePhotometryModel::new(&assoc, kind, 0);

        {
            let mut fit = PhotometryFit::new(&mut assoc, &mut model);
            assert_eq!(fit.minimize("Model", 0.0), Ok(MinimizeResult::Converged));
            assert!(Fitter::compute_chi2(&fit).unwrap().chi2 < 1e-12);
        }

        assert!(model.validate(assoc.ccd_images()));
        for ccd in assoc.ccd_images() {
            let calib = model.calibration(ccd).unwrap();
            let expected = truth.image(ccd.key()).calib;
            assert!(
                ((calib.mean - expected) / expected).abs() < 1e-9,
                "{:?} {}: {} != {}",
                kind,
                ccd.name(),
                calib.mean,
                expected
            );
        }
    }
}

#[test]
fn test_photometry_star_fluxes_follow_measurements() {
    let (mut assoc, truth) = associated(&FieldConfig::noiseless());
    let mut model = SimplePhotometryModel::new(&assoc, PhotometryKind::Magnitude, 0);
    // Fix the model at the truth and fit only the fluxes.
    {
        pin_fitted_stars_to_truth(&mut assoc, &truth);
        let mut fit = PhotometryFit::new(&mut assoc, &mut model);
        assert_eq!(fit.minimize("Model", 0.0), Ok(MinimizeResult::Converged));
    }
    for fs in assoc.fitted_stars_mut() {
        let flux = fs.flux;
        fs.set_flux(flux * 1.1);
    }
    {
        let mut fit = PhotometryFit::new(&mut assoc, &mut model);
        assert_eq!(fit.minimize("Fluxes", 0.0), Ok(MinimizeResult::Converged));
    }
    for k in 0..assoc.fitted_stars().len() {
        let fs = &assoc.fitted_stars()[k];
        let first = assoc.measurements_of(FittedStarId(k))[0];
        let expected = truth.star(assoc.measured_star(first).id).flux;
        assert!(((fs.flux - expected) / expected).abs() < 1e-9);
        // flux and magnitude stay consistent
        assert!((fs.mag - jointcal::star::flux_to_magnitude(fs.flux)).abs() < 1e-9);
    }
}
