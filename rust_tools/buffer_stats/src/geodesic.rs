use crate::error::{AggregationError, Result};
use log::debug;
use serde::{Deserialize, Serialize};

/// Mean radius of Earth in meters (IUGG).
pub const MEAN_EARTH_RADIUS: f64 = 6_371_008.8;

/// Vertex count of generated buffer polygons.
pub const BUFFER_VERTICES: usize = 64;

/// A named point of interest in geographic coordinates (EPSG:4326).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointLocation {
    pub id: String,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lon: f64,
}

impl PointLocation {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lon,
        }
    }
}

/// Great-circle distance in meters between two lat/lon positions.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    MEAN_EARTH_RADIUS * c
}

/// Position reached travelling `distance` meters from (lat, lon) along the
/// initial bearing (degrees clockwise from north). Returns (lat, lon).
pub fn destination(lat: f64, lon: f64, bearing_deg: f64, distance: f64) -> (f64, f64) {
    let delta = distance / MEAN_EARTH_RADIUS;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let sin_phi2 = phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos();
    let phi2 = sin_phi2.clamp(-1.0, 1.0).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * sin_phi2);

    // Normalise longitude to [-180, 180)
    let lon2 = (lambda2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    (phi2.to_degrees(), lon2)
}

/// `lon` shifted by a multiple of 360 to lie within 180 degrees of
/// `reference`.
pub fn unwrap_lon(lon: f64, reference: f64) -> f64 {
    reference + (lon - reference + 540.0).rem_euclid(360.0) - 180.0
}

/// Whole-turn longitude offsets to try when matching geometry near the
/// antimeridian. Zero comes first.
pub const LON_SHIFTS: [f64; 3] = [0.0, 360.0, -360.0];

/// Ground length of one degree of latitude.
pub fn meters_per_degree_lat() -> f64 {
    MEAN_EARTH_RADIUS * std::f64::consts::PI / 180.0
}

/// Ground length of one degree of longitude at the given latitude.
pub fn meters_per_degree_lon(lat: f64) -> f64 {
    meters_per_degree_lat() * lat.to_radians().cos()
}

/// Convert a ground radius to a (rows, cols) search extent on a geographic
/// grid, evaluated at latitude `lat`.
pub fn radius_in_cells(
    radius_meters: f64,
    pixel_width_deg: f64,
    pixel_height_deg: f64,
    lat: f64,
) -> (usize, usize) {
    let row_cells = (radius_meters / (pixel_height_deg * meters_per_degree_lat())).ceil();
    // Guard against the poles where a degree of longitude collapses
    let lon_len = meters_per_degree_lon(lat).max(1.0);
    let col_cells = (radius_meters / (pixel_width_deg * lon_len)).ceil();
    (row_cells as usize, col_cells as usize)
}

/// Axis-aligned lon/lat box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// The same box moved `dlon` degrees east.
    pub fn shifted(&self, dlon: f64) -> Bounds {
        Bounds {
            min_lon: self.min_lon + dlon,
            max_lon: self.max_lon + dlon,
            ..*self
        }
    }

    /// Longitude offsets that make this box overlap `other`, for boxes whose
    /// longitudes may run past +/-180.
    pub fn wrapped_overlaps(&self, other: &Bounds) -> impl Iterator<Item = f64> + '_ {
        let other = *other;
        LON_SHIFTS
            .into_iter()
            .filter(move |&dlon| self.shifted(dlon).overlaps(&other))
    }

    /// Overlap allowing either box to run past +/-180.
    pub fn overlaps_wrapped(&self, other: &Bounds) -> bool {
        self.wrapped_overlaps(other).next().is_some()
    }

    /// Grow the box by a ground distance on every side.
    pub fn expand_meters(&self, meters: f64) -> Bounds {
        let dlat = meters / meters_per_degree_lat();
        let widest_lat = self.min_lat.abs().max(self.max_lat.abs()).min(89.0);
        let dlon = meters / meters_per_degree_lon(widest_lat);
        Bounds {
            min_lon: self.min_lon - dlon,
            min_lat: self.min_lat - dlat,
            max_lon: self.max_lon + dlon,
            max_lat: self.max_lat + dlat,
        }
    }

    fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_lon, self.min_lat),
            (self.max_lon, self.min_lat),
            (self.max_lon, self.max_lat),
            (self.min_lon, self.max_lat),
        ]
    }
}

/// Closed polygon ring of (lon, lat) vertices. The closing edge is implicit.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<(f64, f64)>,
}

impl Polygon {
    pub fn new(vertices: Vec<(f64, f64)>) -> Self {
        Self { vertices }
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    pub fn bbox(&self) -> Bounds {
        let mut bounds = Bounds {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for &(lon, lat) in &self.vertices {
            bounds.min_lon = bounds.min_lon.min(lon);
            bounds.min_lat = bounds.min_lat.min(lat);
            bounds.max_lon = bounds.max_lon.max(lon);
            bounds.max_lat = bounds.max_lat.max(lat);
        }
        bounds
    }

    fn edges(&self) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }
}

/// Circular buffer around a point, approximated by a geodesic polygon.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub center: PointLocation,
    pub radius_m: f64,
    pub polygon: Polygon,
}

impl Buffer {
    /// Exact test against the circle rather than its polygon.
    pub fn within_radius(&self, lon: f64, lat: f64) -> bool {
        haversine_distance(self.center.lat, self.center.lon, lat, lon) <= self.radius_m
    }
}

/// Build the geodesic buffer polygon of `radius_meters` around `point`.
pub fn buffer(point: &PointLocation, radius_meters: f64) -> Result<Buffer> {
    if !(radius_meters > 0.0) || !radius_meters.is_finite() {
        return Err(AggregationError::InvalidRadius(radius_meters));
    }

    // Ring longitudes stay continuous around the center, so a buffer across
    // the antimeridian runs past +/-180 instead of splitting
    let vertices = (0..BUFFER_VERTICES)
        .map(|i| {
            let bearing = 360.0 * i as f64 / BUFFER_VERTICES as f64;
            let (lat, lon) = destination(point.lat, point.lon, bearing, radius_meters);
            (unwrap_lon(lon, point.lon), lat)
        })
        .collect();

    debug!(
        "Buffered point {} ({:.6}, {:.6}) by {} m",
        point.id, point.lat, point.lon, radius_meters
    );

    Ok(Buffer {
        center: point.clone(),
        radius_m: radius_meters,
        polygon: Polygon::new(vertices),
    })
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn segments_cross(p1: (f64, f64), p2: (f64, f64), q1: (f64, f64), q2: (f64, f64)) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// True when the tile footprint and polygon share any area. Partial overlap
/// counts, as does overlap across the antimeridian.
pub fn intersects(tile_bounds: &Bounds, polygon: &Polygon) -> bool {
    let bbox = polygon.bbox();
    tile_bounds
        .wrapped_overlaps(&bbox)
        .any(|dlon| intersects_aligned(&tile_bounds.shifted(dlon), polygon))
}

fn intersects_aligned(tile_bounds: &Bounds, polygon: &Polygon) -> bool {
    if polygon
        .vertices()
        .iter()
        .any(|&(lon, lat)| tile_bounds.contains(lon, lat))
    {
        return true;
    }
    let corners = tile_bounds.corners();
    if corners.iter().any(|&(lon, lat)| polygon.contains(lon, lat)) {
        return true;
    }
    polygon.edges().any(|(a, b)| {
        (0..4).any(|k| segments_cross(a, b, corners[k], corners[(k + 1) % 4]))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn site() -> PointLocation {
        PointLocation::new("serc", 38.0, -77.0)
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_distance(38.0, -77.0, 39.0, -77.0);
        assert_relative_eq!(d, meters_per_degree_lat(), max_relative = 1e-9);
    }

    #[test]
    fn test_destination_round_trip_distance() {
        let (lat, lon) = destination(38.0, -77.0, 73.0, 1000.0);
        let d = haversine_distance(38.0, -77.0, lat, lon);
        assert_relative_eq!(d, 1000.0, max_relative = 1e-6);
    }

    #[test]
    fn test_buffer_vertices_on_circle() {
        let b = buffer(&site(), 500.0).unwrap();
        assert_eq!(b.polygon.vertices().len(), BUFFER_VERTICES);
        for &(lon, lat) in b.polygon.vertices() {
            assert_relative_eq!(haversine_distance(38.0, -77.0, lat, lon), 500.0, max_relative = 1e-6);
        }
        assert!(b.polygon.contains(-77.0, 38.0));
    }

    #[test]
    fn test_buffer_is_geodesic_not_planar() {
        // At 38N a degree of longitude is shorter, so the ring is wider in degrees east-west
        let b = buffer(&site(), 1000.0).unwrap();
        let bbox = b.polygon.bbox();
        let lon_span = bbox.max_lon - bbox.min_lon;
        let lat_span = bbox.max_lat - bbox.min_lat;
        assert!(lon_span > lat_span * 1.2);
    }

    #[test]
    fn test_smaller_buffer_contained_in_larger() {
        let p = site();
        for (r1, r2) in [(100.0, 300.0), (300.0, 500.0), (500.0, 1000.0), (100.0, 100.5)] {
            let inner = buffer(&p, r1).unwrap();
            let outer = buffer(&p, r2).unwrap();
            for &(lon, lat) in inner.polygon.vertices() {
                assert!(outer.polygon.contains(lon, lat), "r1={} r2={}", r1, r2);
            }
        }
    }

    #[test]
    fn test_buffer_rejects_non_positive_radius() {
        assert!(matches!(buffer(&site(), 0.0), Err(AggregationError::InvalidRadius(_))));
        assert!(buffer(&site(), -5.0).is_err());
        assert!(buffer(&site(), f64::NAN).is_err());
    }

    #[test]
    fn test_intersects_partial_overlap() {
        let b = buffer(&site(), 1000.0).unwrap();
        // Tile covering only the eastern edge of the buffer
        let east = Bounds {
            min_lon: -76.995,
            min_lat: 37.9,
            max_lon: -76.9,
            max_lat: 38.1,
        };
        assert!(intersects(&east, &b.polygon));

        // Tile fully enclosing the buffer
        let big = Bounds {
            min_lon: -78.0,
            min_lat: 37.0,
            max_lon: -76.0,
            max_lat: 39.0,
        };
        assert!(intersects(&big, &b.polygon));

        // Tile far away
        let far = Bounds {
            min_lon: -70.0,
            min_lat: 40.0,
            max_lon: -69.0,
            max_lat: 41.0,
        };
        assert!(!intersects(&far, &b.polygon));
    }

    #[test]
    fn test_intersects_bbox_corner_outside_circle() {
        // Box touching the buffer's bounding box corner but not the circle
        let b = buffer(&site(), 1000.0).unwrap();
        let bbox = b.polygon.bbox();
        let corner = Bounds {
            min_lon: bbox.max_lon - 1e-5,
            min_lat: bbox.max_lat - 1e-5,
            max_lon: bbox.max_lon + 0.01,
            max_lat: bbox.max_lat + 0.01,
        };
        assert!(!intersects(&corner, &b.polygon));
    }

    #[test]
    fn test_buffer_across_antimeridian_stays_local() {
        let fiji = PointLocation::new("fiji", -17.0, 179.999);
        let b = buffer(&fiji, 1000.0).unwrap();
        let bbox = b.polygon.bbox();
        assert!(bbox.max_lon > 180.0);
        assert!(bbox.max_lon - bbox.min_lon < 0.1);
        assert!(b.polygon.contains(fiji.lon, fiji.lat));

        // Tiles on either side of the antimeridian both touch the buffer
        let west_of_line = Bounds {
            min_lon: 179.9,
            min_lat: -17.1,
            max_lon: 180.0,
            max_lat: -16.9,
        };
        let east_of_line = Bounds {
            min_lon: -180.0,
            min_lat: -17.1,
            max_lon: -179.9,
            max_lat: -16.9,
        };
        assert!(intersects(&west_of_line, &b.polygon));
        assert!(intersects(&east_of_line, &b.polygon));

        let far_east = Bounds {
            min_lon: -179.0,
            min_lat: -17.1,
            max_lon: -178.9,
            max_lat: -16.9,
        };
        assert!(!intersects(&far_east, &b.polygon));
    }

    #[test]
    fn test_unwrap_lon() {
        assert_relative_eq!(unwrap_lon(-179.99, 179.999), 180.01, epsilon = 1e-9);
        assert_relative_eq!(unwrap_lon(179.99, -179.999), -180.01, epsilon = 1e-9);
        assert_relative_eq!(unwrap_lon(-77.0, -77.01), -77.0, epsilon = 1e-9);
    }

    #[test]
    fn test_radius_in_cells() {
        // 0.00025 deg is ~27.8 m north-south
        let (rows, cols) = radius_in_cells(100.0, 0.00025, 0.00025, 38.0);
        assert_eq!(rows, 4);
        assert_eq!(cols, 5);
    }
}
