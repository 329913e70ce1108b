use log::{debug, warn};
use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::error::Error;
use crate::mux::{demultiplex, SetView};
use crate::params::Coding;
use crate::phase::Phase;
use crate::register;
use crate::stack::{flag, Field, Flags, FrameStack};
use crate::unwrap;

/// Result of fitting one pixel's shot sequence to `A + B·cos(ψ − θ)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinusoidFit {
    pub bias: f64,
    pub amplitude: f64,
    pub phase: Phase,
}

/// Closed-form multi-step estimate for uniformly spaced shift angles.
///
/// Valid when both `Σ exp(iθ)` and `Σ exp(2iθ)` vanish, which holds for a
/// full cycle of uniform shifts with a carrier that shares no factor with
/// the shift count.
fn fit_closed_form(samples: &[f64], cos_t: &[f64], sin_t: &[f64]) -> SinusoidFit {
    let n = samples.len() as f64;
    let mut re = 0.0;
    let mut im = 0.0;
    let mut sum = 0.0;
    for ((&s, &c), &si) in samples.iter().zip(cos_t).zip(sin_t) {
        re += s * c;
        im += s * si;
        sum += s;
    }

    SinusoidFit {
        bias: sum / n,
        amplitude: 2.0 * (re * re + im * im).sqrt() / n,
        phase: Phase::from_rad_wrapped(im.atan2(re)),
    }
}

/// General least-squares fit of the three-parameter sinusoid model,
/// optionally weighted per shot.
///
/// Used for non-uniform shift spacing and whenever the closed form is
/// biased (a carrier sharing a factor with the shift count).
pub fn fit_sinusoid(samples: &[f64], angles: &[f64], weights: Option<&[f64]>) -> SinusoidFit {
    let mut m = Matrix3::zeros();
    let mut b = Vector3::zeros();
    for (n, (&s, &theta)) in samples.iter().zip(angles).enumerate() {
        let w = weights.map_or(1.0, |w| w[n]);
        let row = Vector3::new(1.0, theta.cos(), theta.sin());
        m += w * row * row.transpose();
        b += w * s * row;
    }

    match m.lu().solve(&b) {
        Some(x) => SinusoidFit {
            bias: x[0],
            amplitude: x[1].hypot(x[2]),
            phase: Phase::from_rad_wrapped(x[2].atan2(x[1])),
        },
        None => SinusoidFit {
            bias: samples.iter().sum::<f64>() / samples.len() as f64,
            amplitude: 0.0,
            phase: Phase::from_rad_wrapped(0.0),
        },
    }
}

/// Two-shot estimate with a bias known from a fuller set of the same
/// direction.
fn fit_two_shot(samples: [f64; 2], angles: &[f64], bias: f64) -> SinusoidFit {
    let m = Matrix2::new(
        angles[0].cos(),
        angles[0].sin(),
        angles[1].cos(),
        angles[1].sin(),
    );
    let rhs = Vector2::new(samples[0] - bias, samples[1] - bias);
    match m.lu().solve(&rhs) {
        Some(x) => SinusoidFit {
            bias,
            amplitude: x[0].hypot(x[1]),
            phase: Phase::from_rad_wrapped(x[1].atan2(x[0])),
        },
        None => SinusoidFit {
            bias,
            amplitude: 0.0,
            phase: Phase::from_rad_wrapped(0.0),
        },
    }
}

/// Per-pixel estimates of one coding set over the whole image.
pub(crate) struct SetEstimate {
    pub direction: usize,
    pub set: usize,
    pub period: f64,
    pub shifts: usize,
    pub angles: Vec<f64>,
    pub bias: Vec<f64>,
    pub modulation: Vec<f64>,
    /// Decoded position within one period, in px.
    pub position: Vec<f64>,
    /// Wrapped phase ψ, in radians.
    pub phase: Vec<f64>,
}

/// Options of [`Coding::decode`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeOptions {
    /// Additionally return phase, fringe order, visibility and exposure
    /// maps.
    pub verbose: bool,
    /// Replace implausible pixels by their local neighbourhood estimate.
    /// Never applied unless requested.
    pub despike: bool,
}

/// Additional maps returned when decoding verbosely.
#[derive(Clone, Debug)]
pub struct Verbose {
    /// Wrapped phase per direction and set, direction-major.
    pub phase: Vec<Field>,
    /// Fringe orders per direction and set, direction-major.
    pub orders: Vec<Field>,
    /// Fringe contrast per direction and set, direction-major.
    pub visibility: Vec<Field>,
    /// Relative exposure per direction.
    pub exposure: Vec<Field>,
}

/// The decoded output: one entry per direction unless noted otherwise.
#[derive(Clone, Debug)]
pub struct Decoded {
    /// Local background signal, in DN.
    pub brightness: Vec<Field>,
    /// Local fringe amplitude per direction and set, direction-major, in DN.
    pub modulation: Vec<Field>,
    /// Decoded screen coordinates, in px.
    pub registration: Vec<Field>,
    /// Propagated coordinate standard deviation, in px.
    pub uncertainty: Vec<Field>,
    /// RMS difference between re-encoded and captured intensities, in DN.
    pub residuals: Vec<Field>,
    /// Per-pixel condition flags.
    pub flags: Vec<Flags>,
    /// Extra maps when decoding verbosely.
    pub verbose: Option<Verbose>,
}

impl Coding {
    /// Decodes a captured fringe pattern sequence.
    ///
    /// The stack must have been captured under the same parameter set that
    /// encoded it: the frame and channel counts have to match exactly. The
    /// spatial shape is taken from the data, as it depends on the camera.
    pub fn decode(&self, stack: &FrameStack, options: DecodeOptions) -> Result<Decoded, Error> {
        let derived = self.derived();
        if stack.frames() != derived.frame_count {
            return Err(Error::ShapeMismatch {
                what: "frames",
                expected: derived.frame_count,
                actual: stack.frames(),
            });
        }
        if stack.channels() != derived.channels {
            return Err(Error::ShapeMismatch {
                what: "channels",
                expected: derived.channels,
                actual: stack.channels(),
            });
        }

        let height = stack.height();
        let width = stack.width();
        let px = height * width;

        let mut values = stack.to_f64();
        let y0 = self.params().sensor.dark_signal;
        if y0 > 0.0 {
            values.par_iter_mut().for_each(|v| *v = (*v - y0).max(0.0));
        }

        let (base, views) = demultiplex(self, &values, height, width);
        drop(values);

        let estimates = self.estimate_sets(&base, &views, px);
        debug!(
            "demodulated {} sets over {width}x{height} px",
            estimates.len()
        );

        let decoded = self.assemble(&base, &views, estimates, height, width, options);
        Ok(decoded)
    }

    /// Runs the per-set phase estimation over all pixels.
    fn estimate_sets(&self, base: &[Field], views: &[SetView], px: usize) -> Vec<SetEstimate> {
        let params = self.params();
        let mut estimates: Vec<SetEstimate> = Vec::with_capacity(views.len());

        // Full sets first: two-shot sets borrow their direction's bias.
        let mut order: Vec<usize> = (0..views.len()).collect();
        order.sort_by_key(|&i| {
            let view = &views[i];
            params.sets[view.direction][view.set].shifts < 3
        });

        for i in order {
            let view = &views[i];
            let set = params.sets[view.direction][view.set];
            let planes: Vec<&[f64]> = view.frames.iter().map(|&f| base[f].as_slice()).collect();
            let angles = &view.angles;

            let (bias, modulation, phase) = if set.shifts == 2 {
                let donor = estimates
                    .iter()
                    .find(|e| e.direction == view.direction && e.shifts >= 3)
                    .expect("validation guarantees a full set per direction");
                estimate_two_shot(&planes, angles, &donor.bias, px)
            } else {
                estimate_full(&planes, angles, px)
            };

            let position: Vec<f64> = phase
                .par_iter()
                .map(|&psi| {
                    Phase::from_rad_wrapped(psi + params.phase_offset).to_position(set.period)
                })
                .collect();

            estimates.push(SetEstimate {
                direction: view.direction,
                set: view.set,
                period: set.period,
                shifts: set.shifts,
                angles: angles.clone(),
                bias,
                modulation,
                position,
                phase,
            });
        }

        estimates.sort_by_key(|e| (e.direction, e.set));
        estimates
    }

    /// Unwraps, propagates quality metrics and assembles the output maps.
    fn assemble(
        &self,
        base: &[Field],
        views: &[SetView],
        estimates: Vec<SetEstimate>,
        height: usize,
        width: usize,
        options: DecodeOptions,
    ) -> Decoded {
        let params = self.params();
        let derived = self.derived();
        let d_count = params.directions();
        let px = height * width;

        let mut brightness = Vec::with_capacity(d_count);
        let mut modulation = Vec::new();
        let mut registration = Vec::with_capacity(d_count);
        let mut uncertainty = Vec::with_capacity(d_count);
        let mut residuals = Vec::with_capacity(d_count);
        let mut flags = Vec::with_capacity(d_count);
        let mut verbose_phase = Vec::new();
        let mut verbose_orders = Vec::new();
        let mut verbose_visibility = Vec::new();
        let mut verbose_exposure = Vec::new();

        for d in 0..d_count {
            let dir_sets: Vec<&SetEstimate> =
                estimates.iter().filter(|e| e.direction == d).collect();

            let mut bri = vec![0.0; px];
            for e in &dir_sets {
                for (b, &s) in bri.iter_mut().zip(e.bias.iter()) {
                    *b += s;
                }
            }
            let inv = 1.0 / dir_sets.len() as f64;
            bri.iter_mut().for_each(|b| *b *= inv);

            let outcome = if derived.ambiguous[d] {
                warn!(
                    "direction {d}: unambiguous range {:.1} px below extent; \
                     spatial unwrapping yields a relative map",
                    derived.umr[d]
                );
                unwrap::spatial(&dir_sets, &bri, params.vmin, height, width)
            } else {
                unwrap::temporal(
                    &dir_sets,
                    &bri,
                    derived.umr[d],
                    params.mode,
                    params.vmin,
                    height,
                    width,
                )
            };

            let quality = register::quality(self, &dir_sets, &bri, height, width);

            for e in &dir_sets {
                modulation.push(
                    Field::from_vec(height, width, e.modulation.clone())
                        .expect("set maps match the frame shape"),
                );
            }

            if options.verbose {
                for e in &dir_sets {
                    verbose_phase.push(
                        Field::from_vec(height, width, e.phase.clone())
                            .expect("set maps match the frame shape"),
                    );
                    let vis: Vec<f64> = e
                        .modulation
                        .iter()
                        .zip(bri.iter())
                        .map(|(&m, &b)| if b > 0.0 { m / b } else { 0.0 })
                        .collect();
                    verbose_visibility.push(
                        Field::from_vec(height, width, vis)
                            .expect("set maps match the frame shape"),
                    );
                }
                for orders in &outcome.orders {
                    verbose_orders.push(
                        Field::from_vec(height, width, orders.clone())
                            .expect("set maps match the frame shape"),
                    );
                }
                let imax = params.dtype.max_value();
                let exposure: Vec<f64> = bri.iter().map(|&b| b / imax).collect();
                verbose_exposure.push(
                    Field::from_vec(height, width, exposure)
                        .expect("set maps match the frame shape"),
                );
            }

            let mut reg =
                Field::from_vec(height, width, outcome.registration).expect("map matches shape");
            let mut dir_flags = outcome.flags;

            let all_sets: Vec<&SetEstimate> = estimates.iter().collect();
            let residual =
                register::residual(&all_sets, views, base, params.phase_offset, px, d);
            let residual =
                Field::from_vec(height, width, residual).expect("map matches shape");

            if options.despike {
                register::despike(&mut reg, &residual, &dir_flags);
            }

            // Flag pixels whose combined coordinate escaped the range. A
            // relative (spatially unwrapped) map has no absolute range to
            // escape from.
            if !derived.ambiguous[d] {
                let umr = derived.umr[d];
                for row in 0..height {
                    for col in 0..width {
                        let x = reg.get(row, col);
                        if x.is_finite() && !(0.0..umr).contains(&x) {
                            dir_flags.set(row, col, flag::OUT_OF_RANGE);
                        }
                    }
                }
            }

            brightness.push(Field::from_vec(height, width, bri).expect("map matches shape"));
            registration.push(reg);
            uncertainty.push(quality);
            residuals.push(residual);
            flags.push(dir_flags);
        }

        let verbose = options.verbose.then_some(Verbose {
            phase: verbose_phase,
            orders: verbose_orders,
            visibility: verbose_visibility,
            exposure: verbose_exposure,
        });

        Decoded {
            brightness,
            modulation,
            registration,
            uncertainty,
            residuals,
            flags,
            verbose,
        }
    }
}

/// Estimates bias, modulation and phase for a set with three or more
/// shifts.
fn estimate_full(
    planes: &[&[f64]],
    angles: &[f64],
    px: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let cos_t: Vec<f64> = angles.iter().map(|&t| t.cos()).collect();
    let sin_t: Vec<f64> = angles.iter().map(|&t| t.sin()).collect();

    // The closed form needs both harmonic sums of the shift angles to
    // cancel; otherwise fall back to the least-squares solve.
    let sum1: f64 = cos_t.iter().sum::<f64>().hypot(sin_t.iter().sum::<f64>());
    let sum2 = angles
        .iter()
        .map(|&t| (2.0 * t).cos())
        .sum::<f64>()
        .hypot(angles.iter().map(|&t| (2.0 * t).sin()).sum());
    let closed = sum1 < 1e-9 && sum2 < 1e-9;

    let mut bias = vec![0.0; px];
    let mut modulation = vec![0.0; px];
    let mut phase = vec![0.0; px];

    bias.par_iter_mut()
        .zip(modulation.par_iter_mut())
        .zip(phase.par_iter_mut())
        .enumerate()
        .for_each(|(p, ((b, m), psi))| {
            let samples: Vec<f64> = planes.iter().map(|plane| plane[p]).collect();
            let fit = if closed {
                fit_closed_form(&samples, &cos_t, &sin_t)
            } else {
                fit_sinusoid(&samples, angles, None)
            };
            *b = fit.bias;
            *m = fit.amplitude;
            *psi = fit.phase.into_inner();
        });

    (bias, modulation, phase)
}

/// Estimates modulation and phase for a two-shot set with borrowed bias.
fn estimate_two_shot(
    planes: &[&[f64]],
    angles: &[f64],
    donor_bias: &[f64],
    px: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut modulation = vec![0.0; px];
    let mut phase = vec![0.0; px];

    modulation
        .par_iter_mut()
        .zip(phase.par_iter_mut())
        .enumerate()
        .for_each(|(p, (m, psi))| {
            let fit = fit_two_shot([planes[0][p], planes[1][p]], angles, donor_bias[p]);
            *m = fit.amplitude;
            *psi = fit.phase.into_inner();
        });

    (donor_bias.to_vec(), modulation, phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::f64::consts::TAU;

    fn synth(psi: f64, bias: f64, amplitude: f64, angles: &[f64]) -> Vec<f64> {
        angles
            .iter()
            .map(|&t| bias + amplitude * (psi - t).cos())
            .collect()
    }

    fn uniform_angles(n: usize) -> Vec<f64> {
        (0..n).map(|i| TAU * i as f64 / n as f64).collect()
    }

    #[rstest]
    #[case(0.3, 3)]
    #[case(2.9, 4)]
    #[case(5.1, 5)]
    #[case(1.2, 8)]
    fn closed_form_recovers_parameters(#[case] psi: f64, #[case] n: usize) {
        let angles = uniform_angles(n);
        let cos_t: Vec<f64> = angles.iter().map(|&t| t.cos()).collect();
        let sin_t: Vec<f64> = angles.iter().map(|&t| t.sin()).collect();
        let samples = synth(psi, 120.0, 55.0, &angles);

        let fit = fit_closed_form(&samples, &cos_t, &sin_t);
        assert_relative_eq!(fit.bias, 120.0, max_relative = 1e-9);
        assert_relative_eq!(fit.amplitude, 55.0, max_relative = 1e-9);
        assert_relative_eq!(fit.phase.into_inner(), psi, max_relative = 1e-9);
    }

    #[test]
    fn least_squares_handles_nonuniform_spacing() {
        let angles = [0.0, 1.0, 2.5, 4.0];
        let samples = synth(1.7, 80.0, 30.0, &angles);
        let fit = fit_sinusoid(&samples, &angles, None);
        assert_relative_eq!(fit.bias, 80.0, max_relative = 1e-9);
        assert_relative_eq!(fit.amplitude, 30.0, max_relative = 1e-9);
        assert_relative_eq!(fit.phase.into_inner(), 1.7, max_relative = 1e-9);
    }

    #[test]
    fn least_squares_weights_ignore_outliers() {
        let angles = [0.0, 1.0, 2.5, 4.0, 5.5];
        let mut samples = synth(1.7, 80.0, 30.0, &angles);
        samples[2] = 1000.0;
        let weights = [1.0, 1.0, 0.0, 1.0, 1.0];
        let fit = fit_sinusoid(&samples, &angles, Some(&weights));
        assert_relative_eq!(fit.phase.into_inner(), 1.7, max_relative = 1e-9);
    }

    #[test]
    fn two_shot_with_known_bias() {
        let angles = [0.0, TAU / 4.0];
        let samples = synth(0.9, 100.0, 40.0, &angles);
        let fit = fit_two_shot([samples[0], samples[1]], &angles, 100.0);
        assert_relative_eq!(fit.amplitude, 40.0, max_relative = 1e-9);
        assert_relative_eq!(fit.phase.into_inner(), 0.9, max_relative = 1e-9);
    }

    #[test]
    fn flat_input_has_zero_modulation() {
        let angles = uniform_angles(4);
        let cos_t: Vec<f64> = angles.iter().map(|&t| t.cos()).collect();
        let sin_t: Vec<f64> = angles.iter().map(|&t| t.sin()).collect();
        let fit = fit_closed_form(&[7.0; 4], &cos_t, &sin_t);
        assert_relative_eq!(fit.bias, 7.0);
        assert!(fit.amplitude.abs() < 1e-12);
    }
}
