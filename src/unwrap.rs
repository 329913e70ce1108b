use std::collections::VecDeque;

use log::debug;
use rayon::prelude::*;

use crate::decode::SetEstimate;
use crate::params::FusionMode;
use crate::stack::{flag, Flags};

/// Result of combining the wrapped per-set measurements of one direction.
pub(crate) struct UnwrapOutcome {
    /// Absolute coordinate per pixel, in px; NaN where masked.
    pub registration: Vec<f64>,
    /// Resolved fringe order per set, in the order the sets were given.
    pub orders: Vec<Vec<f64>>,
    pub flags: Flags,
}

/// Signed circular distance between two positions on a ring of the given
/// period, within `(-period/2, period/2]`.
fn ring_distance(a: f64, b: f64, period: f64) -> f64 {
    let d = a - b;
    d - period * (d / period).round()
}

/// Temporal unwrapping: resolves the absolute coordinate from several
/// wrapped positions of different period.
///
/// The fringe order of the coarsest set is searched exhaustively over the
/// unambiguous range; every candidate is scored by its inverse-variance
/// weighted disagreement with the remaining sets. The resolution is exact
/// when the periods are pairwise coprime; when a runner-up candidate
/// explains the data equally well, the pixel is flagged ambiguous and
/// processing continues.
pub(crate) fn temporal(
    sets: &[&SetEstimate],
    brightness: &[f64],
    umr: f64,
    mode: FusionMode,
    vmin: f64,
    height: usize,
    width: usize,
) -> UnwrapOutcome {
    let px = height * width;
    let reference = sets
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.period
                .partial_cmp(&b.period)
                .expect("periods are finite")
        })
        .map(|(i, _)| i)
        .expect("a direction has at least one set");
    let candidates = (umr / sets[reference].period).round().max(1.0) as usize;

    let weights: Vec<f64> = sets
        .iter()
        .map(|e| e.shifts as f64 / (e.period * e.period))
        .collect();
    let weight_sum: f64 = weights.iter().sum();

    // The set refining the fast-mode coordinate: the finest full set.
    let finest = sets
        .iter()
        .enumerate()
        .filter(|(_, e)| e.shifts >= 3)
        .min_by(|(_, a), (_, b)| {
            a.period
                .partial_cmp(&b.period)
                .expect("periods are finite")
        })
        .map(|(i, _)| i)
        .unwrap_or(reference);

    debug!(
        "temporal unwrap over {candidates} candidate orders of the \
         {:.2} px reference period",
        sets[reference].period
    );

    let mut registration = vec![0.0; px];
    let mut orders = vec![vec![0.0; px]; sets.len()];
    let mut flag_bits = vec![0u8; px];

    registration
        .par_iter_mut()
        .zip(flag_bits.par_iter_mut())
        .enumerate()
        .for_each(|(p, (reg, bits))| {
            let reliable = sets.iter().any(|e| {
                let b = e.bias[p];
                b > 0.0 && e.modulation[p] / b > vmin
            });
            if !reliable || brightness[p] <= 0.0 {
                *bits |= flag::LOW_MODULATION;
            }

            let mut best = f64::INFINITY;
            let mut second = f64::INFINITY;
            let mut best_x = sets[reference].position[p];
            for m in 0..candidates {
                let x = m as f64 * sets[reference].period + sets[reference].position[p];
                let mut score = 0.0;
                for (k, e) in sets.iter().enumerate() {
                    if k == reference {
                        continue;
                    }
                    let d = ring_distance(x % e.period, e.position[p], e.period);
                    score += weights[k] * d * d;
                }
                if score < best {
                    second = best;
                    best = score;
                    best_x = x;
                } else if score < second {
                    second = score;
                }
            }

            if candidates > 1 && second - best <= best + weight_sum * 1e-9 {
                *bits |= flag::AMBIGUOUS;
            }

            let resolved: Vec<f64> = sets
                .iter()
                .map(|e| ((best_x - e.position[p]) / e.period).round())
                .collect();

            *reg = match mode {
                FusionMode::Fast => {
                    resolved[finest] * sets[finest].period + sets[finest].position[p]
                }
                FusionMode::Precise => {
                    let sum: f64 = sets
                        .iter()
                        .zip(resolved.iter())
                        .zip(weights.iter())
                        .map(|((e, &k), &w)| w * (k * e.period + e.position[p]))
                        .sum();
                    sum / weight_sum
                }
            };
        });

    // The fringe orders follow from the fused coordinate.
    for (k, e) in sets.iter().enumerate() {
        for p in 0..px {
            orders[k][p] = ((registration[p] - e.position[p]) / e.period).round();
        }
    }

    let mut flags = Flags::empty(height, width);
    for row in 0..height {
        for col in 0..width {
            let bits = flag_bits[row * width + col];
            if bits & flag::LOW_MODULATION != 0 {
                flags.set(row, col, flag::LOW_MODULATION);
            }
            if bits & flag::AMBIGUOUS != 0 {
                flags.set(row, col, flag::AMBIGUOUS);
            }
        }
    }

    UnwrapOutcome {
        registration,
        orders,
        flags,
    }
}

/// Spatial unwrapping: integrates wrapped position gradients outward from
/// the most reliable pixel, resolving period jumps between neighbours.
///
/// Needs spatial continuity; pixels below the modulation threshold are
/// masked, not errors. The result is a relative map, shifted so its
/// minimum is zero, and every decoded pixel is flagged accordingly.
pub(crate) fn spatial(
    sets: &[&SetEstimate],
    brightness: &[f64],
    vmin: f64,
    height: usize,
    width: usize,
) -> UnwrapOutcome {
    let px = height * width;

    // Integrate the coarsest set: its period jumps are the least frequent.
    let coarse = sets
        .iter()
        .max_by(|a, b| {
            a.period
                .partial_cmp(&b.period)
                .expect("periods are finite")
        })
        .expect("a direction has at least one set");
    let period = coarse.period;

    let valid: Vec<bool> = (0..px)
        .map(|p| {
            let b = coarse.bias[p].max(brightness[p]);
            b > 0.0 && coarse.modulation[p] / b > vmin
        })
        .collect();

    let mut flags = Flags::empty(height, width);
    let mut registration = vec![f64::NAN; px];

    // Each connected region of reliable pixels unwraps from its own seed;
    // a masked break only disconnects, it never stops decoding elsewhere.
    loop {
        let seed = (0..px)
            .filter(|&p| valid[p] && registration[p].is_nan())
            .max_by(|&a, &b| {
                coarse.modulation[a]
                    .partial_cmp(&coarse.modulation[b])
                    .expect("modulation is finite")
            });
        let Some(seed) = seed else {
            break;
        };

        registration[seed] = coarse.position[seed];
        let mut queue = VecDeque::from([seed]);
        while let Some(p) = queue.pop_front() {
            let row = p / width;
            let col = p % width;
            let here = registration[p];

            let mut visit = |q: usize| {
                if valid[q] && registration[q].is_nan() {
                    let step = ring_distance(coarse.position[q], coarse.position[p], period);
                    registration[q] = here + step;
                    queue.push_back(q);
                }
            };
            if col > 0 {
                visit(p - 1);
            }
            if col + 1 < width {
                visit(p + 1);
            }
            if row > 0 {
                visit(p - width);
            }
            if row + 1 < height {
                visit(p + width);
            }
        }
    }

    if registration.iter().all(|v| v.is_nan()) {
        debug!("spatial unwrap found no reliable seed pixel");
    }

    let minimum = registration
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    for row in 0..height {
        for col in 0..width {
            let p = row * width + col;
            if registration[p].is_finite() {
                registration[p] -= minimum;
                flags.set(row, col, flag::RELATIVE);
            } else {
                flags.set(row, col, flag::MASKED);
                if !valid[p] {
                    flags.set(row, col, flag::LOW_MODULATION);
                }
            }
        }
    }

    UnwrapOutcome {
        registration,
        orders: vec![vec![f64::NAN; px]; sets.len()],
        flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn synthetic_set(direction: usize, set: usize, period: f64, truth: &[f64]) -> SetEstimate {
        let px = truth.len();
        SetEstimate {
            direction,
            set,
            period,
            shifts: 4,
            angles: vec![],
            bias: vec![128.0; px],
            modulation: vec![100.0; px],
            position: truth.iter().map(|&x| x.rem_euclid(period)).collect(),
            phase: vec![0.0; px],
        }
    }

    #[rstest]
    #[case(FusionMode::Fast)]
    #[case(FusionMode::Precise)]
    fn coprime_pair_is_exact_over_full_range(#[case] mode: FusionMode) {
        let truth: Vec<f64> = (0..91).map(|x| x as f64).collect();
        let a = synthetic_set(0, 0, 7.0, &truth);
        let b = synthetic_set(0, 1, 13.0, &truth);
        let brightness = vec![128.0; truth.len()];

        let outcome = temporal(&[&a, &b], &brightness, 91.0, mode, 0.1, 1, truth.len());
        for (decoded, expected) in outcome.registration.iter().zip(truth.iter()) {
            assert_relative_eq!(*decoded, *expected, epsilon = 1e-9);
        }
        assert_eq!(outcome.flags.count(flag::AMBIGUOUS), 0);
    }

    #[test]
    fn noncoprime_pair_aliases_beyond_its_range() {
        // lcm(4, 6) = 12, so positions repeat every 12 px even though the
        // period product would suggest 24.
        let truth: Vec<f64> = (0..24).map(|x| x as f64).collect();
        let a = synthetic_set(0, 0, 4.0, &truth);
        let b = synthetic_set(0, 1, 6.0, &truth);
        let brightness = vec![128.0; truth.len()];

        let outcome = temporal(
            &[&a, &b],
            &brightness,
            12.0,
            FusionMode::Fast,
            0.1,
            1,
            truth.len(),
        );
        for (decoded, expected) in outcome.registration.iter().zip(truth.iter()) {
            assert_relative_eq!(*decoded, expected.rem_euclid(12.0), epsilon = 1e-9);
        }
    }

    #[test]
    fn near_tie_is_flagged_ambiguous() {
        // Identical periods carry no extra information: every candidate of
        // the second fringe order scores the same.
        let truth = vec![5.0];
        let a = synthetic_set(0, 0, 6.0, &truth);
        let b = synthetic_set(0, 1, 6.0, &truth);
        let brightness = vec![128.0; 1];

        let outcome = temporal(
            &[&a, &b],
            &brightness,
            12.0,
            FusionMode::Fast,
            0.1,
            1,
            1,
        );
        assert_eq!(outcome.flags.count(flag::AMBIGUOUS), 1);
    }

    #[test]
    fn low_modulation_is_flagged_not_fatal() {
        let truth = vec![3.0, 4.0];
        let mut a = synthetic_set(0, 0, 7.0, &truth);
        let b = synthetic_set(0, 1, 13.0, &truth);
        a.modulation = vec![0.0; 2];
        let mut weak = b;
        weak.modulation = vec![0.0; 2];

        let outcome = temporal(
            &[&a, &weak],
            &vec![128.0; 2],
            91.0,
            FusionMode::Fast,
            0.05,
            1,
            2,
        );
        assert_eq!(outcome.flags.count(flag::LOW_MODULATION), 2);
        assert_eq!(outcome.registration.len(), 2);
    }

    #[test]
    fn spatial_recovers_a_relative_ramp() {
        // A 1x32 ramp wrapped at 10 px: the unwrapped map equals the ramp
        // up to a constant offset (zero here, since the minimum maps to 0).
        let truth: Vec<f64> = (0..32).map(|x| x as f64).collect();
        let set = synthetic_set(0, 0, 10.0, &truth);
        let brightness = vec![128.0; truth.len()];

        let outcome = spatial(&[&set], &brightness, 0.1, 1, truth.len());
        for (decoded, expected) in outcome.registration.iter().zip(truth.iter()) {
            assert_relative_eq!(*decoded, *expected, epsilon = 1e-9);
        }
        assert_eq!(outcome.flags.count(flag::RELATIVE), truth.len());
    }

    #[test]
    fn spatial_masks_low_modulation_pixels() {
        let truth: Vec<f64> = (0..16).map(|x| x as f64).collect();
        let mut set = synthetic_set(0, 0, 10.0, &truth);
        set.modulation[5] = 0.0;
        let brightness = vec![128.0; truth.len()];

        let outcome = spatial(&[&set], &brightness, 0.1, 1, truth.len());
        assert!(outcome.registration[5].is_nan());
        assert_eq!(outcome.flags.count(flag::MASKED), 1);
        // The break does not stop decoding on the far side of the mask.
        assert!(outcome.registration[15].is_finite());
    }
}
