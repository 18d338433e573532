use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Kilometers per degree of latitude (and of longitude at the equator).
const KM_PER_DEGREE: f64 = 111.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Cheap latitude/longitude-delta prefilter applied before the precise
/// haversine computation. Conservative: may let a point through that the
/// exact distance rejects, never the other way around.
pub fn within_bounding_box(center: &GeoPoint, point: &GeoPoint, radius_km: f64) -> bool {
    let lat_delta_deg = radius_km / KM_PER_DEGREE;

    let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
    let lng_delta_deg = radius_km / (KM_PER_DEGREE * cos_lat);

    (point.lat - center.lat).abs() <= lat_delta_deg
        && (point.lng - center.lng).abs() <= lng_delta_deg
}

/// Local equirectangular projection of `p` relative to `origin`, in km.
/// Accurate enough at city scale, where the tracker operates.
fn to_local_km(p: &GeoPoint, origin: &GeoPoint) -> (f64, f64) {
    let x = (p.lng - origin.lng) * KM_PER_DEGREE * origin.lat.to_radians().cos();
    let y = (p.lat - origin.lat) * KM_PER_DEGREE;
    (x, y)
}

/// Nearest point of segment `a`-`b` to `p`, as a fraction t in [0,1] along
/// the segment plus the perpendicular deviation in km.
fn project_onto_segment(p: &GeoPoint, a: &GeoPoint, b: &GeoPoint) -> (f64, f64) {
    let (px, py) = to_local_km(p, a);
    let (bx, by) = to_local_km(b, a);

    let seg_len_sq = bx * bx + by * by;
    if seg_len_sq < 1e-12 {
        return (0.0, haversine_km(p, a));
    }

    let t = ((px * bx + py * by) / seg_len_sq).clamp(0.0, 1.0);
    let (dx, dy) = (px - t * bx, py - t * by);
    (t, (dx * dx + dy * dy).sqrt())
}

pub fn route_length_km(points: &[GeoPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_km(&pair[0], &pair[1]))
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteProjection {
    /// Distance traveled from the route start to the nearest on-route point.
    pub traveled_km: f64,
    /// Perpendicular deviation from the route to the reported point.
    pub deviation_km: f64,
}

/// Project `p` onto a polyline route and report how far along the route the
/// nearest point lies. Picks the segment with minimum deviation; among
/// equally-near segments the earliest wins.
pub fn project_onto_route(points: &[GeoPoint], p: &GeoPoint) -> Option<RouteProjection> {
    if points.is_empty() {
        return None;
    }
    if points.len() == 1 {
        return Some(RouteProjection {
            traveled_km: 0.0,
            deviation_km: haversine_km(p, &points[0]),
        });
    }

    let mut cumulative = 0.0;
    let mut best: Option<RouteProjection> = None;

    for pair in points.windows(2) {
        let seg_len = haversine_km(&pair[0], &pair[1]);
        let (t, deviation) = project_onto_segment(p, &pair[0], &pair[1]);

        let candidate = RouteProjection {
            traveled_km: cumulative + t * seg_len,
            deviation_km: deviation,
        };
        if best
            .as_ref()
            .is_none_or(|current| candidate.deviation_km < current.deviation_km)
        {
            best = Some(candidate);
        }

        cumulative += seg_len;
    }

    best
}
