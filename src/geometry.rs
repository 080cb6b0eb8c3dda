// src/geometry.rs - Angles and two-point similarity transform, in degrees
// Degenerate inputs never panic and never yield NaN.

use nalgebra::{Rotation2, Vector2};

use crate::landmarks::{LandmarkSet, Point};

/// Angle at `p2` between the rays `p2 -> p1` and `p2 -> p3`, in [0, 180].
pub fn angle_at_vertex(p1: Point, p2: Point, p3: Point) -> f64 {
    let v1 = Vector2::new(p1.x - p2.x, p1.y - p2.y);
    let v2 = Vector2::new(p3.x - p2.x, p3.y - p2.y);

    let len1 = v1.norm();
    let len2 = v2.norm();
    if len1 == 0.0 || len2 == 0.0 {
        return 0.0;
    }

    let cos_angle = (v1.dot(&v2) / (len1 * len2)).clamp(-1.0, 1.0);
    cos_angle.acos().to_degrees()
}

/// Direction of the segment `p1 -> p2` relative to the +x axis, in (-180, 180].
pub fn line_angle(p1: Point, p2: Point) -> f64 {
    let dx = p2.x - p1.x;
    let dy = p2.y - p1.y;
    if dx == 0.0 && dy == 0.0 {
        return 0.0;
    }
    dy.atan2(dx).to_degrees()
}

/// Unsigned angle between two lines, folded into [0, 180].
pub fn angle_between_lines(l1p1: Point, l1p2: Point, l2p1: Point, l2p2: Point) -> f64 {
    let diff = (line_angle(l1p1, l1p2) - line_angle(l2p1, l2p2)).abs();
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Parameters of a 2D similarity transform mapping `src1 -> dst1` and
/// the direction/length of `src1 -> src2` onto `dst1 -> dst2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub scale: f64,
    pub rotation: Rotation2<f64>,
    pub src_origin: Vector2<f64>,
    pub dst_origin: Vector2<f64>,
}

impl Similarity {
    /// Returns `None` when either anchor pair is coincident or non-finite.
    pub fn from_anchors(src1: Point, src2: Point, dst1: Point, dst2: Point) -> Option<Self> {
        if ![src1, src2, dst1, dst2].iter().all(Point::is_finite) {
            return None;
        }

        let src = Vector2::new(src2.x - src1.x, src2.y - src1.y);
        let dst = Vector2::new(dst2.x - dst1.x, dst2.y - dst1.y);

        let src_len = src.norm();
        let dst_len = dst.norm();
        if src_len == 0.0 || dst_len == 0.0 {
            return None;
        }

        let rotation = src.y.atan2(src.x);
        let target = dst.y.atan2(dst.x);

        Some(Self {
            scale: dst_len / src_len,
            rotation: Rotation2::new(target - rotation),
            src_origin: Vector2::new(src1.x, src1.y),
            dst_origin: Vector2::new(dst1.x, dst1.y),
        })
    }

    pub fn apply(&self, p: Point) -> Point {
        let local = Vector2::new(p.x, p.y) - self.src_origin;
        let out = self.rotation * local * self.scale + self.dst_origin;
        Point::new(out.x, out.y)
    }
}

/// Remap every landmark with the similarity defined by two anchor pairs.
///
/// Coincident or non-finite anchors make the transform undefined; the input
/// is returned unchanged in that case.
pub fn similarity_transform(
    points: &LandmarkSet,
    src_anchor1: Point,
    src_anchor2: Point,
    dst_anchor1: Point,
    dst_anchor2: Point,
) -> LandmarkSet {
    match Similarity::from_anchors(src_anchor1, src_anchor2, dst_anchor1, dst_anchor2) {
        Some(similarity) => points.map_points(|_, p| similarity.apply(p)),
        None => points.clone(),
    }
}
