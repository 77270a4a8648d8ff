//! Polygon geometry shared by ROI validation (API boundary) and the
//! Behavior/ROI Analyzer (hot path). Kept dependency-free so both sides
//! agree on exactly one definition of "inside".

/// Open Question resolution (spec.md §9): a polygon whose last vertex does
/// not coincide with the first is treated as implicitly closed for every
/// geometric test below — point-in-polygon, self-intersection, and area.
/// Callers never need to duplicate the first vertex at the end.
fn closed_edges(polygon: &[(f32, f32)]) -> impl Iterator<Item = ((f32, f32), (f32, f32))> + '_ {
    let n = polygon.len();
    (0..n).map(move |i| (polygon[i], polygon[(i + 1) % n]))
}

/// Ray-casting point-in-polygon test.
pub fn contains_point(polygon: &[(f32, f32)], x: f32, y: f32) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    for ((x1, y1), (x2, y2)) in closed_edges(polygon) {
        if (y1 > y) != (y2 > y) {
            let x_intersect = (x2 - x1) * (y - y1) / (y2 - y1) + x1;
            if x < x_intersect {
                inside = !inside;
            }
        }
    }
    inside
}

/// Shoelace-formula signed area of the (implicitly closed) polygon.
pub fn signed_area(polygon: &[(f32, f32)]) -> f32 {
    let mut sum = 0.0f32;
    for ((x1, y1), (x2, y2)) in closed_edges(polygon) {
        sum += x1 * y2 - x2 * y1;
    }
    sum / 2.0
}

fn segments_intersect(a: (f32, f32), b: (f32, f32), c: (f32, f32), d: (f32, f32)) -> bool {
    fn cross(o: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);
    ((d1 > 0.0) != (d2 > 0.0)) && ((d3 > 0.0) != (d4 > 0.0))
}

/// True if any two non-adjacent edges of the (implicitly closed) polygon
/// cross.
pub fn is_self_intersecting(polygon: &[(f32, f32)]) -> bool {
    let n = polygon.len();
    if n < 4 {
        return false;
    }
    let edges: Vec<((f32, f32), (f32, f32))> = closed_edges(polygon).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            // skip adjacent edges (and the wrap-around pair), which always
            // share an endpoint and would trivially "intersect" there.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            let (a, b) = edges[i];
            let (c, d) = edges[j];
            if segments_intersect(a, b, c, d) {
                return true;
            }
        }
    }
    false
}

#[derive(Debug, Clone, Copy)]
pub struct PolygonBounds {
    pub min_points: usize,
    pub canvas_width: f32,
    pub canvas_height: f32,
    pub min_area: f32,
    pub max_area: f32,
}

impl Default for PolygonBounds {
    fn default() -> Self {
        Self {
            min_points: 3,
            canvas_width: 16384.0,
            canvas_height: 16384.0,
            min_area: 1.0,
            max_area: f32::MAX,
        }
    }
}

/// Validates a polygon per spec §8 property 8: >= 3 points, within canvas
/// bounds, not self-intersecting (unless explicitly permitted), and within
/// area bounds.
pub fn validate_polygon(
    polygon: &[(f32, f32)],
    bounds: &PolygonBounds,
    allow_self_intersecting: bool,
) -> Result<(), String> {
    if polygon.len() < bounds.min_points {
        return Err(format!(
            "polygon needs at least {} points, got {}",
            bounds.min_points,
            polygon.len()
        ));
    }
    for &(x, y) in polygon {
        if x < 0.0 || y < 0.0 || x > bounds.canvas_width || y > bounds.canvas_height {
            return Err(format!("vertex ({x}, {y}) outside canvas bounds"));
        }
    }
    let area = signed_area(polygon).abs();
    if area < bounds.min_area {
        return Err(format!("polygon area {area} below minimum {}", bounds.min_area));
    }
    if area > bounds.max_area {
        return Err(format!("polygon area {area} exceeds maximum {}", bounds.max_area));
    }
    if !allow_self_intersecting && is_self_intersecting(polygon) {
        return Err("polygon is self-intersecting".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<(f32, f32)> {
        vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]
    }

    #[test]
    fn point_inside_square() {
        assert!(contains_point(&square(), 5.0, 5.0));
        assert!(!contains_point(&square(), 15.0, 5.0));
    }

    #[test]
    fn implicit_closure_matches_explicit() {
        let implicit = square();
        let mut explicit = square();
        explicit.push(explicit[0]);
        // explicit has a duplicated vertex but closed_edges still wraps
        // correctly since contains_point ignores the final repeated point
        // via modulo indexing over the original (non-deduped) slice.
        assert_eq!(
            contains_point(&implicit, 5.0, 5.0),
            contains_point(&explicit[..explicit.len() - 1], 5.0, 5.0)
        );
    }

    #[test]
    fn bowtie_self_intersects() {
        let bowtie = vec![(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)];
        assert!(is_self_intersecting(&bowtie));
    }

    #[test]
    fn square_does_not_self_intersect() {
        assert!(!is_self_intersecting(&square()));
    }

    #[test]
    fn validator_rejects_too_few_points() {
        let bounds = PolygonBounds::default();
        let err = validate_polygon(&[(0.0, 0.0), (1.0, 1.0)], &bounds, false);
        assert!(err.is_err());
    }

    #[test]
    fn validator_accepts_square() {
        let bounds = PolygonBounds {
            canvas_width: 1000.0,
            canvas_height: 1000.0,
            ..Default::default()
        };
        assert!(validate_polygon(&square(), &bounds, false).is_ok());
    }
}
