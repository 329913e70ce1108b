use std::f64::consts::TAU;

/// Describes the circular phase of a fringe signal at one pixel.
///
/// The angle is always within `[0, 2π)`.
#[derive(Clone, Copy, Debug, PartialOrd)]
pub struct Phase {
    rad: f64,
}

impl Phase {
    /// Creates a new `Phase` from an angle in radians.
    ///
    /// Returns `None` if `rad` is not within `[0, 2π)`.
    pub fn from_rad(rad: f64) -> Option<Self> {
        if !(0.0..TAU).contains(&rad) {
            return None;
        }

        Some(Self { rad })
    }

    /// Creates a new `Phase` from an angle in radians, wrapping into `[0, 2π)`.
    pub fn from_rad_wrapped(rad: f64) -> Self {
        let mut rad = rad % TAU;
        if rad < 0.0 {
            rad += TAU;
        }

        // A negative value epsilon-close to zero wraps onto TAU itself.
        if rad >= TAU {
            rad = 0.0;
        }

        Self::from_rad(rad).expect("angle is within 0 to 2-pi after wrapping")
    }

    /// Converts a fraction of one fringe period into a `Phase`.
    pub fn from_turns(turns: f64) -> Self {
        Self::from_rad_wrapped(turns * TAU)
    }

    /// The position within one fringe period of length `period` that this
    /// phase encodes.
    pub fn to_position(self, period: f64) -> f64 {
        self.rad / TAU * period
    }

    /// Signed circular distance from `other` to `self`, within `(-π, π]`.
    pub fn distance(self, other: Phase) -> f64 {
        let mut d = self.rad - other.rad;
        if d > TAU / 2.0 {
            d -= TAU;
        } else if d <= -TAU / 2.0 {
            d += TAU;
        }
        d
    }

    /// Returns true if `other` is within `thres` radians of `self`,
    /// handling wrapping.
    pub fn in_thres(self, other: Phase, thres: f64) -> bool {
        self.distance(other).abs() <= thres
    }

    pub fn into_inner(self) -> f64 {
        self.rad
    }
}

impl std::ops::Add for Phase {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::from_rad_wrapped(self.rad + other.rad)
    }
}

impl std::ops::Sub for Phase {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::from_rad_wrapped(self.rad - other.rad)
    }
}

impl std::cmp::PartialEq for Phase {
    fn eq(&self, other: &Phase) -> bool {
        self.rad == other.rad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck::quickcheck;
    use rstest::rstest;

    quickcheck! {
        fn phase_from_wrapped(rad: f64) -> bool {
            if !rad.is_finite() {
                return true;
            }

            // Will panic if wrapping produced an out-of-range angle.
            Phase::from_rad_wrapped(rad);
            true
        }
    }

    #[rstest]
    #[case(TAU)]
    #[case(-0.1)]
    #[case(7.0)]
    fn invalid_phase(#[case] rad: f64) {
        assert_eq!(Phase::from_rad(rad), None);
    }

    #[rstest]
    #[case(1.0, 2.0, 3.0)]
    #[case(5.0, 2.0, 7.0 - TAU)]
    fn add_phase(#[case] lhs: f64, #[case] rhs: f64, #[case] sum: f64) {
        let result = Phase::from_rad(lhs).unwrap() + Phase::from_rad(rhs).unwrap();
        assert_relative_eq!(result.into_inner(), sum, max_relative = 1e-12);
    }

    #[rstest]
    #[case(0.1, TAU - 0.1, 0.2)]
    #[case(TAU - 0.1, 0.1, -0.2)]
    #[case(1.0, 2.0, -1.0)]
    fn wrapped_distance(#[case] a: f64, #[case] b: f64, #[case] d: f64) {
        let result = Phase::from_rad(a).unwrap().distance(Phase::from_rad(b).unwrap());
        assert_relative_eq!(result, d, max_relative = 1e-12);
    }

    #[rstest]
    #[case(0.25, 20.0, 5.0)]
    #[case(0.0, 20.0, 0.0)]
    fn position_within_period(#[case] turns: f64, #[case] period: f64, #[case] pos: f64) {
        assert_relative_eq!(Phase::from_turns(turns).to_position(period), pos);
    }
}
