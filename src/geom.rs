//! Planar and spherical geometry shared by the association and fit code.
//!
//! Sky positions are `(ra, dec)` in degrees. Tangent-plane coordinates are the
//! gnomonic (TAN) projection `(ξ, η)` about a tangent point, also expressed in
//! degrees so that tangent-plane distances read directly as angles near the
//! tangent point.

use nalgebra::{Matrix2, Vector3};

/// A 2D point: pixel, focal-plane or tangent-plane coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A position on the celestial sphere, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SkyPoint {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPoint {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Unit vector pointing at this position.
    pub fn uvec(&self) -> Vector3<f64> {
        radec_to_uvec(self.ra, self.dec)
    }

    pub fn is_finite(&self) -> bool {
        self.ra.is_finite() && self.dec.is_finite()
    }
}

/// Axis-aligned rectangle, usually a CCD bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Frame {
    /// Build a frame from two opposite corners, in any order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x_min: x0.min(x1),
            y_min: y0.min(y1),
            x_max: x0.max(x1),
            y_max: y0.max(y1),
        }
    }

    /// Smallest frame containing every point. `None` for an empty slice.
    pub fn around(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut frame = Frame::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            frame.x_min = frame.x_min.min(p.x);
            frame.y_min = frame.y_min.min(p.y);
            frame.x_max = frame.x_max.max(p.x);
            frame.y_max = frame.y_max.max(p.y);
        }
        Some(frame)
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn center(&self) -> Point {
        Point::new(
            0.5 * (self.x_min + self.x_max),
            0.5 * (self.y_min + self.y_max),
        )
    }

    /// Corners in counter-clockwise order starting at `(x_min, y_min)`.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x_min, self.y_min),
            Point::new(self.x_max, self.y_min),
            Point::new(self.x_max, self.y_max),
            Point::new(self.x_min, self.y_max),
        ]
    }

    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.x_min && p.x <= self.x_max && p.y >= self.y_min && p.y <= self.y_max
    }

    /// Regular `n × n` grid of sample points spanning the frame, edges included.
    pub fn grid(&self, n: usize) -> Vec<Point> {
        let n = n.max(2);
        let step_x = self.width() / (n - 1) as f64;
        let step_y = self.height() / (n - 1) as f64;
        let mut points = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                points.push(Point::new(
                    self.x_min + i as f64 * step_x,
                    self.y_min + j as f64 * step_y,
                ));
            }
        }
        points
    }
}

/// A cap on the sky: all points within `radius` degrees of `center`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCircle {
    pub center: SkyPoint,
    pub radius: f64,
}

impl SkyCircle {
    pub fn contains(&self, p: &SkyPoint) -> bool {
        angular_separation(&self.center, p) <= self.radius
    }
}

// ── Sphere ──────────────────────────────────────────────────────────────────

/// Convert (ra, dec) in degrees to a unit vector.
pub fn radec_to_uvec(ra: f64, dec: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra.to_radians().sin_cos();
    let (sin_dec, cos_dec) = dec.to_radians().sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

/// Convert a (not necessarily unit) vector to (ra, dec) in degrees, ra in [0, 360).
pub fn uvec_to_radec(v: &Vector3<f64>) -> SkyPoint {
    let ra = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    let dec = v.z.atan2(v.x.hypot(v.y)).to_degrees();
    SkyPoint::new(ra, dec)
}

/// Great-circle separation in degrees.
///
/// Uses the atan2 form, which stays accurate for both tiny and near-antipodal
/// separations.
pub fn angular_separation(a: &SkyPoint, b: &SkyPoint) -> f64 {
    let u = a.uvec();
    let v = b.uvec();
    u.cross(&v).norm().atan2(u.dot(&v)).to_degrees()
}

// ── Gnomonic projection ─────────────────────────────────────────────────────

/// Gnomonic (TAN) projection of `sky` about `tangent`.
///
/// Returns `(ξ, η)` in degrees, or `None` when the position lies on or behind
/// the plane of the sky through the tangent point.
pub fn tan_project(sky: &SkyPoint, tangent: &SkyPoint) -> Option<Point> {
    let da = (sky.ra - tangent.ra).to_radians();
    let (sin_dec, cos_dec) = sky.dec.to_radians().sin_cos();
    let (sin_dec0, cos_dec0) = tangent.dec.to_radians().sin_cos();
    let (sin_da, cos_da) = da.sin_cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }

    let xi = cos_dec * sin_da / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some(Point::new(xi.to_degrees(), eta.to_degrees()))
}

/// Inverse gnomonic projection: tangent-plane `(ξ, η)` in degrees to the sky.
pub fn tan_deproject(p: &Point, tangent: &SkyPoint) -> SkyPoint {
    let xi = p.x.to_radians();
    let eta = p.y.to_radians();
    let (sin_dec0, cos_dec0) = tangent.dec.to_radians().sin_cos();

    let denom = cos_dec0 - eta * sin_dec0;
    let ra = tangent.ra.to_radians() + xi.atan2(denom);
    let dec = (sin_dec0 + eta * cos_dec0).atan2(xi.hypot(denom));
    SkyPoint::new(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
}

/// Jacobian `∂(ξ, η) / ∂(ra, dec)` of the gnomonic projection at `sky`.
///
/// Both sides are in degrees, so the matrix is dimensionless.
pub fn tan_project_derivative(sky: &SkyPoint, tangent: &SkyPoint) -> Option<Matrix2<f64>> {
    let da = (sky.ra - tangent.ra).to_radians();
    let (sin_dec, cos_dec) = sky.dec.to_radians().sin_cos();
    let (sin_dec0, cos_dec0) = tangent.dec.to_radians().sin_cos();
    let (sin_da, cos_da) = da.sin_cos();

    let d = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if d <= 1e-12 {
        return None;
    }
    let x = cos_dec * sin_da;
    let y = cos_dec0 * sin_dec - sin_dec0 * cos_dec * cos_da;

    let dx_da = cos_dec * cos_da;
    let dx_dd = -sin_dec * sin_da;
    let dy_da = sin_dec0 * cos_dec * sin_da;
    let dy_dd = cos_dec0 * cos_dec + sin_dec0 * sin_dec * cos_da;
    let dd_da = -cos_dec0 * cos_dec * sin_da;
    let dd_dd = sin_dec0 * cos_dec - cos_dec0 * sin_dec * cos_da;

    let d2 = d * d;
    Some(Matrix2::new(
        (dx_da * d - x * dd_da) / d2,
        (dx_dd * d - x * dd_dd) / d2,
        (dy_da * d - y * dd_da) / d2,
        (dy_dd * d - y * dd_dd) / d2,
    ))
}

// ── Planar helpers ──────────────────────────────────────────────────────────

/// Smallest circle enclosing every point, as `(center, radius)`.
///
/// Incremental construction: each point outside the current circle is forced
/// onto the boundary, then the circle is rebuilt from the points seen so far.
/// Cubic in the worst case, which is fine for the few hundred bbox corners of
/// a calibration run.
pub fn enclosing_circle(points: &[Point]) -> Option<(Point, f64)> {
    let first = *points.first()?;
    let mut center = first;
    let mut radius = 0.0;

    for i in 1..points.len() {
        if inside(&center, radius, &points[i]) {
            continue;
        }
        center = points[i];
        radius = 0.0;
        for j in 0..i {
            if inside(&center, radius, &points[j]) {
                continue;
            }
            center = midpoint(&points[i], &points[j]);
            radius = center.distance(&points[i]);
            for k in 0..j {
                if inside(&center, radius, &points[k]) {
                    continue;
                }
                (center, radius) = circumcircle(&points[i], &points[j], &points[k]);
            }
        }
    }
    Some((center, radius))
}

fn inside(center: &Point, radius: f64, p: &Point) -> bool {
    center.distance(p) <= radius * (1.0 + 1e-12) + 1e-15
}

fn midpoint(a: &Point, b: &Point) -> Point {
    Point::new(0.5 * (a.x + b.x), 0.5 * (a.y + b.y))
}

/// Circle through three points; falls back to the widest pair when collinear.
fn circumcircle(a: &Point, b: &Point, c: &Point) -> (Point, f64) {
    let bx = b.x - a.x;
    let by = b.y - a.y;
    let cx = c.x - a.x;
    let cy = c.y - a.y;
    let d = 2.0 * (bx * cy - by * cx);
    if d.abs() < 1e-300 {
        let pairs = [(a, b), (a, c), (b, c)];
        let (p, q) = pairs
            .into_iter()
            .max_by(|l, r| l.0.distance(l.1).total_cmp(&r.0.distance(r.1)))
            .unwrap_or((a, b));
        let center = midpoint(p, q);
        return (center, center.distance(p));
    }
    let b2 = bx * bx + by * by;
    let c2 = cx * cx + cy * cy;
    let ux = (cy * b2 - by * c2) / d;
    let uy = (bx * c2 - cx * b2) / d;
    let center = Point::new(a.x + ux, a.y + uy);
    let radius = center
        .distance(a)
        .max(center.distance(b))
        .max(center.distance(c));
    (center, radius)
}
