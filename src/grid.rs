use nalgebra::{Rotation2, Vector2};
use serde::{Deserialize, Serialize};

use crate::params::Coding;
use crate::stack::Field;

/// Target coordinate system of a registration remap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GridKind {
    /// Origin at the top-left pixel, positive right and down.
    Image,
    /// Origin at the centre, positive right and up.
    Cartesian,
    /// Azimuth (rad, clockwise) and radius (px) about the centre.
    Polar,
    /// Azimuth (rad, clockwise) and log-radius about the centre.
    LogPolar,
}

/// Coordinate matrices of the requested system over a `height` × `width`
/// grid, optionally rotated by `angle` radians about the centre.
///
/// Returns one field per axis: (right, down) for the image system,
/// (right, up) for Cartesian, (azimuth, radius) for the polar systems.
pub fn template(kind: GridKind, height: usize, width: usize, angle: f64) -> [Field; 2] {
    let mut first = Field::filled(height, width, 0.0);
    let mut second = Field::filled(height, width, 0.0);
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let rotation = Rotation2::new(-angle);

    for row in 0..height {
        for col in 0..width {
            let (a, b) = project(kind, col as f64, row as f64, cx, cy, &rotation);
            first.set(row, col, a);
            second.set(row, col, b);
        }
    }

    [first, second]
}

/// Remaps a pair of decoded image-space coordinate maps into the requested
/// system, pixel by pixel.
///
/// Out-of-range inputs (NaN from masked pixels) stay NaN.
pub fn remap(x: &Field, y: &Field, kind: GridKind, angle: f64) -> [Field; 2] {
    let height = x.height();
    let width = x.width();
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let rotation = Rotation2::new(-angle);

    let mut first = Field::filled(height, width, f64::NAN);
    let mut second = Field::filled(height, width, f64::NAN);
    for row in 0..height {
        for col in 0..width {
            let u = x.get(row, col);
            let v = y.get(row, col);
            if !u.is_finite() || !v.is_finite() {
                continue;
            }
            let (a, b) = project(kind, u, v, cx, cy, &rotation);
            first.set(row, col, a);
            second.set(row, col, b);
        }
    }

    [first, second]
}

fn project(
    kind: GridKind,
    u: f64,
    v: f64,
    cx: f64,
    cy: f64,
    rotation: &Rotation2<f64>,
) -> (f64, f64) {
    let centred = rotation * Vector2::new(u - cx, v - cy);
    match kind {
        GridKind::Image => (centred.x + cx, centred.y + cy),
        GridKind::Cartesian => (centred.x, -centred.y),
        GridKind::Polar => (centred.y.atan2(centred.x), centred.norm()),
        GridKind::LogPolar => (centred.y.atan2(centred.x), centred.norm().max(1e-12).ln()),
    }
}

/// Mask of the circle inscribed into the grid: 1 inside, 0 outside.
///
/// Polar codings only carry information inside this circle.
pub fn inner_circle(height: usize, width: usize) -> Field {
    let mut mask = Field::filled(height, width, 0.0);
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let radius = (width.min(height) as f64) / 2.0;

    for row in 0..height {
        for col in 0..width {
            let dx = col as f64 - cx;
            let dy = row as f64 - cy;
            if (dx * dx + dy * dy).sqrt() <= radius {
                mask.set(row, col, 1.0);
            }
        }
    }
    mask
}

impl Coding {
    /// The coordinate matrices the encoder codes, one field per direction.
    ///
    /// A decoded registration of an undisturbed capture reproduces these.
    pub fn coordinates(&self) -> Vec<Field> {
        let height = self.params().height;
        let width = self.params().width;

        (0..self.params().directions())
            .map(|d| {
                let mut field = Field::filled(height, width, 0.0);
                for row in 0..height {
                    for col in 0..width {
                        field.set(row, col, self.coordinate(d, row, col));
                    }
                }
                field
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn image_template_is_the_identity() {
        let [x, y] = template(GridKind::Image, 3, 4, 0.0);
        assert_eq!(x.get(1, 2), 2.0);
        assert_eq!(y.get(1, 2), 1.0);
    }

    #[test]
    fn cartesian_template_is_centred() {
        let [x, y] = template(GridKind::Cartesian, 3, 3, 0.0);
        assert_eq!(x.get(1, 1), 0.0);
        assert_eq!(y.get(1, 1), 0.0);
        assert_eq!(x.get(1, 2), 1.0);
        // Positive y points up.
        assert_eq!(y.get(0, 1), 1.0);
    }

    #[rstest]
    #[case(std::f64::consts::FRAC_PI_2)]
    #[case(0.7)]
    fn rotation_preserves_radius(#[case] angle: f64) {
        let [_, r0] = template(GridKind::Polar, 9, 9, 0.0);
        let [_, r1] = template(GridKind::Polar, 9, 9, angle);
        for row in 0..9 {
            for col in 0..9 {
                assert_relative_eq!(r0.get(row, col), r1.get(row, col), epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn remap_keeps_nan_masked() {
        let mut x = Field::filled(2, 2, 1.0);
        let y = Field::filled(2, 2, 1.0);
        x.set(0, 0, f64::NAN);
        let [a, _] = remap(&x, &y, GridKind::Cartesian, 0.0);
        assert!(a.get(0, 0).is_nan());
        assert!(a.get(1, 1).is_finite());
    }

    #[test]
    fn inner_circle_masks_corners() {
        let mask = inner_circle(8, 8);
        assert_eq!(mask.get(0, 0), 0.0);
        assert_eq!(mask.get(4, 4), 1.0);
    }
}
