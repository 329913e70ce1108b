use log::debug;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::params::Coding;
use crate::stack::Field;

/// How the logically independent coding channels are folded into the
/// physically captured frames.
///
/// The mode set is closed; every consumer handles it by exhaustive match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Multiplex {
    /// One physical frame per logical shot, concatenated direction-major,
    /// set-major, shot-minor. The default.
    Temporal,
    /// Both directions share each physical frame in disjoint carrier bands
    /// (a crossed pattern); separated by a Fourier band split on decode.
    Spatial,
    /// Each coding set occupies one colour channel of the same frames.
    Wavelength,
    /// All sets superimpose into one shot sequence at distinct temporal
    /// carriers; separated by matched filtering on decode.
    Frequency,
}

impl Default for Multiplex {
    fn default() -> Self {
        Multiplex::Temporal
    }
}

/// The shots belonging to one direction/set after demultiplexing: indices
/// into the base frame list plus the temporal shift angle of each shot.
#[derive(Clone, Debug)]
pub(crate) struct SetView {
    pub direction: usize,
    pub set: usize,
    pub frames: Vec<usize>,
    pub angles: Vec<f64>,
}

/// Set views over an unfolded (temporal-order) base frame list.
pub(crate) fn temporal_views(coding: &Coding) -> Vec<SetView> {
    let mut views = Vec::new();
    let mut offset = 0;
    for (d, sets) in coding.params().sets.iter().enumerate() {
        for (k, set) in sets.iter().enumerate() {
            let carrier = coding.derived().carriers[d][k];
            views.push(SetView {
                direction: d,
                set: k,
                frames: (offset..offset + set.shifts).collect(),
                angles: set.shift_angles(carrier, coding.params().reverse),
            });
            offset += set.shifts;
        }
    }
    views
}

/// Inverts the folding: recovers per-set base frames from the physical
/// stack values and describes which frames belong to which set.
///
/// `values` is the physical stack in `(frame, row, column, channel)` order
/// with the configured channel count.
pub(crate) fn demultiplex(
    coding: &Coding,
    values: &[f64],
    height: usize,
    width: usize,
) -> (Vec<Field>, Vec<SetView>) {
    let px = height * width;
    let params = coding.params();
    let derived = coding.derived();

    match params.multiplex {
        Multiplex::Temporal => {
            let frames = values
                .chunks(px)
                .map(|chunk| {
                    Field::from_vec(height, width, chunk.to_vec())
                        .expect("chunk length matches the frame shape")
                })
                .collect();
            (frames, temporal_views(coding))
        }
        Multiplex::Spatial => {
            debug!("separating crossed pattern into axis bands");
            let phys = derived.frame_count;
            let mut fields: Vec<Field> = (0..2 * phys)
                .map(|_| Field::filled(height, width, 0.0))
                .collect();
            let (first, second) = fields.split_at_mut(phys);
            first
                .par_iter_mut()
                .zip(second.par_iter_mut())
                .enumerate()
                .for_each(|(t, (fx, fy))| {
                    let frame = &values[t * px..(t + 1) * px];
                    let (bx, by) = band_split(frame, height, width);
                    fx.as_mut_slice().copy_from_slice(&bx);
                    fy.as_mut_slice().copy_from_slice(&by);
                });

            // Views over the unfolded list: direction 0 occupies the first
            // half, direction 1 the second, in temporal order.
            (fields, temporal_views(coding))
        }
        Multiplex::Wavelength => {
            let channels = derived.channels;
            let views = temporal_views(coding);
            let mut fields: Vec<Field> = (0..derived.base_frame_count)
                .map(|_| Field::filled(height, width, 0.0))
                .collect();
            for (j, view) in views.iter().enumerate() {
                for (t, &base_index) in view.frames.iter().enumerate() {
                    let frame = &values[t * px * channels..(t + 1) * px * channels];
                    let dst = fields[base_index].as_mut_slice();
                    for p in 0..px {
                        dst[p] = frame[p * channels + j];
                    }
                }
            }
            (fields, views)
        }
        Multiplex::Frequency => {
            // Every set reads the same shot sequence; separation happens in
            // the matched filter through the per-set carrier angles.
            let fields: Vec<Field> = values
                .chunks(px)
                .map(|chunk| {
                    Field::from_vec(height, width, chunk.to_vec())
                        .expect("chunk length matches the frame shape")
                })
                .collect();
            let frames: Vec<usize> = (0..derived.frame_count).collect();
            let views = temporal_views(coding)
                .into_iter()
                .map(|view| SetView {
                    frames: frames.clone(),
                    ..view
                })
                .collect();
            (fields, views)
        }
    }
}

/// Discrete frequency of bin `i` in an `n`-point transform, in cycles per
/// sample.
fn fft_freq(i: usize, n: usize) -> f64 {
    let i = i as isize;
    let n = n as isize;
    let signed = if i <= n / 2 { i } else { i - n };
    signed as f64 / n as f64
}

/// Splits one crossed frame into its column-fringe and row-fringe bands.
///
/// The band masks keep |fx| ≥ |fy| resp. |fx| ≤ |fy|; the shared base band
/// carries the bias into both outputs, which is exactly the bias each
/// direction contributed.
fn band_split(frame: &[f64], height: usize, width: usize) -> (Vec<f64>, Vec<f64>) {
    let mut planner = FftPlanner::<f64>::new();
    let mut spectrum: Vec<Complex<f64>> =
        frame.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft_2d(&mut spectrum, height, width, &mut planner, false);

    let mut bx = spectrum.clone();
    let mut by = spectrum;
    for y in 0..height {
        let fy = fft_freq(y, height).abs();
        for x in 0..width {
            let fx = fft_freq(x, width).abs();
            let i = y * width + x;
            if fx < fy {
                bx[i] = Complex::new(0.0, 0.0);
            }
            if fx > fy {
                by[i] = Complex::new(0.0, 0.0);
            }
        }
    }

    fft_2d(&mut bx, height, width, &mut planner, true);
    fft_2d(&mut by, height, width, &mut planner, true);

    let norm = 1.0 / (height * width) as f64;
    (
        bx.into_iter().map(|c| c.re * norm).collect(),
        by.into_iter().map(|c| c.re * norm).collect(),
    )
}

/// In-place 2-D FFT over a row-major buffer: rows first, then columns.
fn fft_2d(
    buf: &mut [Complex<f64>],
    height: usize,
    width: usize,
    planner: &mut FftPlanner<f64>,
    inverse: bool,
) {
    let row_fft = if inverse {
        planner.plan_fft_inverse(width)
    } else {
        planner.plan_fft_forward(width)
    };
    for row in buf.chunks_mut(width) {
        row_fft.process(row);
    }

    let col_fft = if inverse {
        planner.plan_fft_inverse(height)
    } else {
        planner.plan_fft_forward(height)
    };
    let mut column = vec![Complex::new(0.0, 0.0); height];
    for x in 0..width {
        for y in 0..height {
            column[y] = buf[y * width + x];
        }
        col_fft.process(&mut column);
        for y in 0..height {
            buf[y * width + x] = column[y];
        }
    }
}
