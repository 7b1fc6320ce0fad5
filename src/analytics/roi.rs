use serde::{Deserialize, Deserializer, Serialize};

use super::object::BoundingBox;

/// Region of interest in frame pixel space. Detections whose centre falls
/// outside it are ignored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Polygon(Vec<[f32; 2]>);

/// Clients send points either as `[x, y]` or `{"x": .., "y": ..}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Pair([f32; 2]),
    Named { x: f32, y: f32 },
}

impl<'de> Deserialize<'de> for Polygon {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<RawPoint>::deserialize(deserializer)?;
        Ok(Polygon(
            raw.into_iter()
                .map(|p| match p {
                    RawPoint::Pair(xy) => xy,
                    RawPoint::Named { x, y } => [x, y],
                })
                .collect(),
        ))
    }
}

impl Polygon {
    pub fn new(points: Vec<[f32; 2]>) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[[f32; 2]] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.len() >= 3 && self.0.iter().all(|[x, y]| x.is_finite() && y.is_finite())
    }

    /// Even-odd test; points on an edge count as inside.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let pts = &self.0;
        if pts.len() < 3 {
            return true;
        }

        let mut inside = false;
        let mut j = pts.len() - 1;
        for i in 0..pts.len() {
            let [xi, yi] = pts[i];
            let [xj, yj] = pts[j];

            if on_segment(x, y, xi, yi, xj, yj) {
                return true;
            }

            if (yi > y) != (yj > y) {
                let cross_x = xi + (y - yi) * (xj - xi) / (yj - yi);
                if x < cross_x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    pub fn contains_box(&self, bbox: &BoundingBox) -> bool {
        let (cx, cy) = bbox.center();
        self.contains(cx, cy)
    }
}

fn on_segment(px: f32, py: f32, ax: f32, ay: f32, bx: f32, by: f32) -> bool {
    let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
    if cross.abs() > 1e-3 {
        return false;
    }
    px >= ax.min(bx) && px <= ax.max(bx) && py >= ay.min(by) && py <= ay.max(by)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Polygon {
        Polygon::new(vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]])
    }

    #[test]
    fn inside_outside_and_edge() {
        let roi = square();
        assert!(roi.contains(50.0, 50.0));
        assert!(!roi.contains(150.0, 50.0));
        assert!(!roi.contains(-1.0, 50.0));
        assert!(roi.contains(100.0, 50.0));
    }

    #[test]
    fn concave_polygon() {
        // U shape open at the top between x=30..70.
        let roi = Polygon::new(vec![
            [0.0, 0.0],
            [30.0, 0.0],
            [30.0, 60.0],
            [70.0, 60.0],
            [70.0, 0.0],
            [100.0, 0.0],
            [100.0, 100.0],
            [0.0, 100.0],
        ]);
        assert!(!roi.contains(50.0, 30.0));
        assert!(roi.contains(50.0, 80.0));
        assert!(roi.contains(10.0, 30.0));
    }

    #[test]
    fn box_filtered_by_centre() {
        let roi = square();
        let inside = BoundingBox::new(80.0, 80.0, 30.0, 30.0);
        let outside = BoundingBox::new(95.0, 95.0, 30.0, 30.0);
        assert!(roi.contains_box(&inside));
        assert!(!roi.contains_box(&outside));
    }

    #[test]
    fn accepts_both_point_shapes() {
        let a: Polygon = serde_json::from_str("[[0,0],[1,0],[1,1]]").unwrap();
        let b: Polygon =
            serde_json::from_str(r#"[{"x":0,"y":0},{"x":1,"y":0},{"x":1,"y":1}]"#).unwrap();
        assert_eq!(a, b);
        assert!(a.is_valid());
        assert_eq!(serde_json::to_string(&a).unwrap(), "[[0.0,0.0],[1.0,0.0],[1.0,1.0]]");
    }
}
