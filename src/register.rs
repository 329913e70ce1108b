use std::f64::consts::TAU;

use rayon::prelude::*;

use crate::decode::SetEstimate;
use crate::mux::SetView;
use crate::params::Coding;
use crate::stack::{flag, Field, Flags};

/// Propagates the sensor noise model into a per-pixel coordinate
/// uncertainty for one direction.
///
/// Intensity noise maps to a per-set phase uncertainty through the local
/// modulation, to a positional uncertainty through the set period, and the
/// per-set variances fuse inversely. Pixels without usable modulation get
/// an infinite uncertainty rather than a fabricated one.
pub(crate) fn quality(
    coding: &Coding,
    sets: &[&SetEstimate],
    brightness: &[f64],
    height: usize,
    width: usize,
) -> Field {
    let params = coding.params();
    let sensor = params.sensor;
    let quant = params.dtype.quantum() / 12f64.sqrt();
    let dark = sensor.gain * sensor.dark_noise;
    let fixed_var = dark * dark + quant * quant;

    let mut uncertainty = vec![0.0; height * width];
    uncertainty
        .par_iter_mut()
        .enumerate()
        .for_each(|(p, u)| {
            let shot_var = if sensor.gain > 0.0 {
                sensor.gain * (brightness[p] - sensor.dark_signal).max(0.0)
            } else {
                0.0
            };
            let noise = (fixed_var + shot_var).sqrt();

            let mut inv_var = 0.0;
            for e in sets {
                let b = e.modulation[p];
                if b <= 0.0 {
                    continue;
                }
                let upi = 2f64.sqrt() / (e.shifts as f64).sqrt() / (b / noise);
                let uxi = upi / TAU * e.period;
                inv_var += 1.0 / (uxi * uxi);
            }

            *u = if inv_var > 0.0 {
                (1.0 / inv_var).sqrt()
            } else {
                f64::INFINITY
            };
        });

    Field::from_vec(height, width, uncertainty).expect("map matches the frame shape")
}

/// RMS difference between the shots captured for one direction and the
/// intensities re-encoded from every fitted bias, modulation and phase.
///
/// An independent fit-quality signal: zero up to quantization for a clean
/// capture, and growing with any injected intensity noise. Predictions
/// superimpose all sets sharing a frame (frequency multiplexing folds both
/// directions into the same shots), with the bias entering once per frame.
pub(crate) fn residual(
    all_sets: &[&SetEstimate],
    views: &[SetView],
    base: &[Field],
    phase_offset: f64,
    px: usize,
    direction: usize,
) -> Vec<f64> {
    let mut per_frame: std::collections::BTreeMap<usize, Vec<(&SetEstimate, usize)>> =
        std::collections::BTreeMap::new();
    for e in all_sets {
        let view = views
            .iter()
            .find(|v| v.direction == e.direction && v.set == e.set)
            .expect("every estimate has a view");
        for (n, &frame) in view.frames.iter().enumerate() {
            per_frame.entry(frame).or_default().push((e, n));
        }
    }

    // Only the frames this direction was decoded from enter its residual.
    let direction_frames: std::collections::BTreeSet<usize> = views
        .iter()
        .filter(|v| v.direction == direction)
        .flat_map(|v| v.frames.iter().copied())
        .collect();
    let per_frame: Vec<(usize, Vec<(&SetEstimate, usize)>)> = per_frame
        .into_iter()
        .filter(|(frame, _)| direction_frames.contains(frame))
        .collect();

    let mut residual = vec![0.0; px];
    residual.par_iter_mut().enumerate().for_each(|(p, r)| {
        let mut sum_sq = 0.0;
        for (frame, parts) in &per_frame {
            let share = 1.0 / parts.len() as f64;
            let mut value = 0.0;
            for &(e, n) in parts {
                let psi = TAU * e.position[p] / e.period - phase_offset;
                value += e.modulation[p] * (psi - e.angles[n]).cos() + e.bias[p] * share;
            }
            let diff = base[*frame].as_slice()[p] - value;
            sum_sq += diff * diff;
        }

        *r = if per_frame.is_empty() {
            0.0
        } else {
            (sum_sq / per_frame.len() as f64).sqrt()
        };
    });

    residual
}

/// Replaces implausible coordinates by the median of their 3×3
/// neighbourhood.
///
/// A pixel counts as implausible when it is flagged low-modulation or its
/// fit residual stands far above the typical level. Only invoked when the
/// caller opted in.
pub(crate) fn despike(registration: &mut Field, residual: &Field, flags: &Flags) {
    let height = registration.height();
    let width = registration.width();

    let mut sorted: Vec<f64> = residual
        .as_slice()
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("values are finite"));
    let typical = sorted.get(sorted.len() / 2).copied().unwrap_or(0.0);
    let threshold = 5.0 * typical + 1e-6;

    let source = registration.clone();
    for row in 0..height {
        for col in 0..width {
            let spiky = flags.is_set(row, col, flag::LOW_MODULATION)
                || residual.get(row, col) > threshold
                || !source.get(row, col).is_finite();
            if !spiky {
                continue;
            }

            let mut neighbours: Vec<f64> = Vec::with_capacity(9);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let y = row as i64 + dy;
                    let x = col as i64 + dx;
                    if y < 0 || x < 0 || y >= height as i64 || x >= width as i64 {
                        continue;
                    }
                    let v = source.get(y as usize, x as usize);
                    if v.is_finite() {
                        neighbours.push(v);
                    }
                }
            }
            if neighbours.is_empty() {
                continue;
            }
            neighbours.sort_by(|a, b| a.partial_cmp(b).expect("values are finite"));
            registration.set(row, col, neighbours[neighbours.len() / 2]);
        }
    }
}
