//! Synthetic multi-exposure fields shared by the integration tests.
//!
//! Every image sees the sky through an exactly linear pixel → tangent-plane
//! map about one field center, so the truth is representable by every model
//! the crate fits. Exposures differ by a dither and a small rotation, and the
//! initial WCS handed to the crate is a perturbed copy of the truth.

#![allow(dead_code)]

use jointcal::geom::tan_project;
use jointcal::{
    Associations, AstrometryTransform, CcdImage, CcdImageKey, CcdImageMetadata, DetectionRecord,
    Frame, LinearTransform, PhotoCalib, Point, ReferenceCatalog, SkyPoint, SkyWcs,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// 0.2 arcsec per pixel.
pub const PIXEL_SCALE_DEG: f64 = 0.2 / 3600.0;
pub const EPOCH: f64 = 2020.0;
pub const FLUX_FIELD: &str = "r";

pub fn field_center() -> SkyPoint {
    SkyPoint::new(150.0, 2.0)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub n_visits: usize,
    pub n_chips: usize,
    /// Chip side (pixels).
    pub chip_size: f64,
    /// Gap between chips in the focal plane (pixels).
    pub chip_gap: f64,
    pub star_spacing_arcsec: f64,
    /// Actual centroid noise (pixels).
    pub centroid_noise_px: f64,
    /// Reported centroid error (pixels).
    pub centroid_error_px: f64,
    /// Actual relative flux noise.
    pub flux_noise: f64,
    /// Reported relative flux error.
    pub flux_error: f64,
    /// Dither step between visits (arcsec).
    pub dither_arcsec: f64,
    /// Maximum shift of the initial WCS from the truth (arcsec).
    pub wcs_error_arcsec: f64,
    /// Relative scale error of the initial WCS.
    pub wcs_scale_error: f64,
    /// Relative error of the input photometric calibration.
    pub calib_error: f64,
    /// Offset (pixels, along x) applied to the detection nearest the center
    /// of the first image.
    pub outlier_offset_px: f64,
    pub seed: u64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            n_visits: 3,
            n_chips: 2,
            chip_size: 1000.0,
            chip_gap: 50.0,
            star_spacing_arcsec: 20.0,
            centroid_noise_px: 0.02,
            centroid_error_px: 0.02,
            flux_noise: 0.005,
            flux_error: 0.005,
            dither_arcsec: 30.0,
            wcs_error_arcsec: 0.5,
            wcs_scale_error: 1e-4,
            calib_error: 0.05,
            outlier_offset_px: 0.0,
            seed: 42,
        }
    }
}

impl FieldConfig {
    /// No noise on centroids or fluxes.
    pub fn noiseless() -> Self {
        Self {
            centroid_noise_px: 0.0,
            flux_noise: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrueStar {
    pub id: u64,
    pub sky: SkyPoint,
    /// nJy
    pub flux: f64,
}

#[derive(Debug, Clone)]
pub struct TrueImage {
    pub key: CcdImageKey,
    pub bbox: Frame,
    /// Exact pixel → tangent plane about [`field_center`].
    pub pixel_to_tp: LinearTransform,
    /// nJy per count.
    pub calib: f64,
}

impl TrueImage {
    pub fn pixel_to_sky(&self, p: &Point) -> SkyPoint {
        SkyWcs::new(field_center(), AstrometryTransform::Linear(self.pixel_to_tp)).pixel_to_sky(p)
    }
}

#[derive(Debug, Clone)]
pub struct Truth {
    pub stars: Vec<TrueStar>,
    pub images: Vec<TrueImage>,
    /// Image and star id of the displaced detection, if any.
    pub outlier: Option<(CcdImageKey, u64)>,
}

impl Truth {
    /// Star ids equal their index.
    pub fn star(&self, id: u64) -> &TrueStar {
        &self.stars[id as usize]
    }

    pub fn image(&self, key: CcdImageKey) -> &TrueImage {
        self.images
            .iter()
            .find(|i| i.key == key)
            .expect("unknown image")
    }

    /// Reference catalog of every true star, with exact positions and fluxes.
    pub fn reference_catalog(&self) -> ReferenceCatalog {
        let mut refcat = ReferenceCatalog::new(
            self.stars.iter().map(|s| s.id).collect(),
            self.stars.iter().map(|s| s.sky.ra).collect(),
            self.stars.iter().map(|s| s.sky.dec).collect(),
            EPOCH,
        );
        refcat.set_flux_field(
            FLUX_FIELD,
            self.stars.iter().map(|s| s.flux).collect(),
            self.stars.iter().map(|s| 0.01 * s.flux).collect(),
        );
        let err = 5.0 / 3.6e6;
        refcat.ra_err = Some(vec![err; self.stars.len()]);
        refcat.dec_err = Some(vec![err; self.stars.len()]);
        refcat
    }
}

fn rotation_scale(theta: f64, scale: f64) -> (f64, f64, f64, f64) {
    let (s, c) = theta.sin_cos();
    (scale * c, -scale * s, scale * s, scale * c)
}

/// Build a field: the associations (images only, nothing associated yet) and
/// the truth it was drawn from.
pub fn generate(config: &FieldConfig) -> (Associations, Truth) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let center = field_center();
    let pitch = config.chip_size + config.chip_gap;
    let focal_width = config.n_chips as f64 * pitch - config.chip_gap;

    // Stars on a jittered grid covering every dithered exposure.
    let half_x = (focal_width / 2.0 + 2.0 * config.dither_arcsec / 0.2) * PIXEL_SCALE_DEG + 0.01;
    let half_y = (config.chip_size / 2.0 + 2.0 * config.dither_arcsec / 0.2) * PIXEL_SCALE_DEG + 0.01;
    let spacing = config.star_spacing_arcsec / 3600.0;
    let jitter = 0.25 * spacing;
    let mut stars = Vec::new();
    let mut y = -half_y;
    while y <= half_y {
        let mut x = -half_x;
        while x <= half_x {
            let tp = Point::new(
                x + rng.random_range(-jitter..jitter),
                y + rng.random_range(-jitter..jitter),
            );
            let sky = jointcal::geom::tan_deproject(&tp, &center);
            stars.push(TrueStar {
                id: stars.len() as u64,
                sky,
                flux: rng.random_range(2e4..2e5),
            });
            x += spacing;
        }
        y += spacing;
    }

    let centroid_noise = Normal::new(0.0, config.centroid_noise_px).expect("valid sigma");
    let flux_noise = Normal::new(0.0, config.flux_noise).expect("valid sigma");
    let bbox = Frame::new(0.0, 0.0, config.chip_size, config.chip_size);

    let mut images = Vec::new();
    let mut ccd_images = Vec::new();
    let mut outlier = None;
    for v in 0..config.n_visits {
        let visit = 1000 + v as i64;
        let theta = 0.002 * v as f64;
        let dither_px = Point::new(
            config.dither_arcsec / 0.2 * (v % 2) as f64,
            config.dither_arcsec / 0.2 * (v / 2) as f64,
        );
        for c in 0..config.n_chips {
            let ccd = 10 + c as i32;
            let origin = Point::new(
                c as f64 * pitch - focal_width / 2.0,
                -config.chip_size / 2.0,
            );
            let (a11, a12, a21, a22) = rotation_scale(theta, PIXEL_SCALE_DEG);
            let shift = Point::new(origin.x + dither_px.x, origin.y + dither_px.y);
            let pixel_to_tp = LinearTransform::new(
                a11 * shift.x + a12 * shift.y,
                a21 * shift.x + a22 * shift.y,
                a11,
                a12,
                a21,
                a22,
            );
            let tp_to_pixel = pixel_to_tp.inverted().expect("invertible");
            let calib = 0.04 * (1.0 + 0.03 * c as f64) * (1.0 + 0.02 * v as f64);

            let mut records = Vec::new();
            for star in &stars {
                let Some(tp) = tan_project(&star.sky, &center) else {
                    continue;
                };
                let p = tp_to_pixel.apply(&tp);
                if p.x < 1.0 || p.y < 1.0 || p.x > config.chip_size - 1.0 || p.y > config.chip_size - 1.0
                {
                    continue;
                }
                let inst_flux = star.flux / calib * (1.0 + flux_noise.sample(&mut rng));
                records.push(DetectionRecord {
                    id: star.id,
                    x: p.x + centroid_noise.sample(&mut rng),
                    y: p.y + centroid_noise.sample(&mut rng),
                    x_err: config.centroid_error_px,
                    y_err: config.centroid_error_px,
                    xy_cov: 0.0,
                    inst_flux,
                    inst_flux_err: config.flux_error * inst_flux,
                    flags: 0,
                });
            }

            if config.outlier_offset_px != 0.0 && outlier.is_none() {
                let mid = config.chip_size / 2.0;
                let nearest = records
                    .iter_mut()
                    .min_by(|a, b| {
                        let da = (a.x - mid).hypot(a.y - mid);
                        let db = (b.x - mid).hypot(b.y - mid);
                        da.total_cmp(&db)
                    });
                if let Some(record) = nearest {
                    record.x += config.outlier_offset_px;
                    outlier = Some((CcdImageKey { visit, ccd }, record.id));
                }
            }

            let e = config.wcs_error_arcsec / 3600.0;
            let k = 1.0 + config.wcs_scale_error;
            let initial = LinearTransform::new(
                pixel_to_tp.dx + rng.random_range(-e..=e),
                pixel_to_tp.dy + rng.random_range(-e..=e),
                a11 * k,
                a12 * k,
                a21 * k,
                a22 * k,
            );
            let calib_error = config.calib_error;
            let meta = CcdImageMetadata {
                visit,
                ccd,
                filter: FLUX_FIELD.to_string(),
                bbox,
                photo_calib: PhotoCalib {
                    mean: calib * (1.0 + rng.random_range(-calib_error..=calib_error)),
                    err: 0.001 * calib,
                },
                pixel_to_focal: AstrometryTransform::Shift {
                    dx: origin.x,
                    dy: origin.y,
                },
                epoch: EPOCH,
            };
            let wcs = SkyWcs::new(center, AstrometryTransform::Linear(initial));
            ccd_images.push(CcdImage::new(&records, wcs, meta));
            images.push(TrueImage {
                key: CcdImageKey { visit, ccd },
                bbox,
                pixel_to_tp,
                calib,
            });
        }
    }

    (
        Associations::with_ccd_images(ccd_images),
        Truth {
            stars,
            images,
            outlier,
        },
    )
}

/// CCD image whose WCS is an exact TAN about `tangent` with the given
/// tangent-plane origin (degrees), holding one detection per sky position.
pub fn ccd_image_at(
    visit: i64,
    ccd: i32,
    tangent: SkyPoint,
    origin_tp: Point,
    detections: &[(u64, SkyPoint)],
) -> CcdImage {
    let pixel_to_tp = LinearTransform::new(
        origin_tp.x,
        origin_tp.y,
        PIXEL_SCALE_DEG,
        0.0,
        0.0,
        PIXEL_SCALE_DEG,
    );
    let tp_to_pixel = pixel_to_tp.inverted().expect("invertible");
    let records: Vec<DetectionRecord> = detections
        .iter()
        .map(|(id, sky)| {
            let p = tp_to_pixel.apply(&tan_project(sky, &tangent).expect("projectable"));
            DetectionRecord {
                id: *id,
                x: p.x,
                y: p.y,
                x_err: 0.02,
                y_err: 0.02,
                xy_cov: 0.0,
                inst_flux: 1000.0,
                inst_flux_err: 10.0,
                flags: 0,
            }
        })
        .collect();
    let meta = CcdImageMetadata {
        visit,
        ccd,
        filter: FLUX_FIELD.to_string(),
        bbox: Frame::new(0.0, 0.0, 1000.0, 1000.0),
        photo_calib: PhotoCalib {
            mean: 0.04,
            err: 0.0004,
        },
        pixel_to_focal: AstrometryTransform::Identity,
        epoch: EPOCH,
    };
    CcdImage::new(
        &records,
        SkyWcs::new(tangent, AstrometryTransform::Linear(pixel_to_tp)),
        meta,
    )
}

/// Sky position `(dx, dy)` arcsec away from `p` in the tangent plane of `p`.
pub fn offset_arcsec(p: SkyPoint, dx: f64, dy: f64) -> SkyPoint {
    jointcal::geom::tan_deproject(&Point::new(dx / 3600.0, dy / 3600.0), &p)
}
