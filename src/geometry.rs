//! Polygon path helpers.

use serde_json::Value;

use crate::entities::LatLng;

const EPSILON: f64 = 1e-9;

fn same_point(a: &LatLng, b: &LatLng) -> bool {
    (a.lat - b.lat).abs() < EPSILON && (a.lng - b.lng).abs() < EPSILON
}

/// Drop a trailing vertex that repeats the first (closed ring form).
fn open_ring(path: &[LatLng]) -> &[LatLng] {
    match path {
        [first, .., last] if path.len() > 1 && same_point(first, last) => &path[..path.len() - 1],
        _ => path,
    }
}

/// Whether two paths trace the same ring, whatever vertex they start from
/// and whichever way round they go.
pub fn same_path(a: &[LatLng], b: &[LatLng]) -> bool {
    let (a, b) = (open_ring(a), open_ring(b));
    if a.len() != b.len() {
        return false;
    }
    if a.is_empty() {
        return true;
    }

    let n = a.len();
    (0..n).filter(|&start| same_point(&a[0], &b[start])).any(|start| {
        let forward = (0..n).all(|i| same_point(&a[i], &b[(start + i) % n]));
        let backward = (0..n).all(|i| same_point(&a[i], &b[(start + n - i) % n]));
        forward || backward
    })
}

/// Read a path from JSON: either `[[lat, lng], ...]` or
/// `[{"lat": .., "lng": ..}, ...]`. A closing vertex that repeats the first
/// is dropped.
pub fn extract_path(polygon: &Value) -> Option<Vec<LatLng>> {
    let path: Vec<LatLng> = serde_json::from_value(polygon.clone()).ok()?;
    Some(open_ring(&path).to_vec())
}
