use std::f64::consts::TAU;

use log::debug;
use rayon::prelude::*;

use crate::error::Error;
use crate::mux::{temporal_views, Multiplex, SetView};
use crate::params::Coding;
use crate::stack::FrameStack;

impl Coding {
    /// Encodes the complete fringe pattern sequence.
    ///
    /// Pure function of the configuration: identical parameters always
    /// reproduce the identical stack.
    pub fn encode(&self) -> FrameStack {
        let all: Vec<usize> = (0..self.derived().frame_count).collect();
        self.encode_frames(&all)
            .expect("all frame indices are within the sequence")
    }

    /// Encodes an arbitrary subset of physical frames, in the given order.
    pub fn encode_frames(&self, frames: &[usize]) -> Result<FrameStack, Error> {
        let derived = self.derived();
        let params = self.params();
        let height = params.height;
        let width = params.width;
        let px = height * width;
        let channels = derived.channels;

        for &t in frames {
            if t >= derived.frame_count {
                return Err(Error::ShapeMismatch {
                    what: "frame index",
                    expected: derived.frame_count,
                    actual: t,
                });
            }
        }

        let views = temporal_views(self);
        let mut values = vec![0.0; frames.len() * px * channels];
        values
            .par_chunks_mut(px * channels)
            .zip(frames.par_iter())
            .for_each(|(out, &t)| self.render_physical(t, &views, out));

        debug!("encoded {} frames of {}x{}x{channels}", frames.len(), height, width);
        FrameStack::from_f64(
            frames.len(),
            height,
            width,
            channels,
            params.dtype,
            values,
        )
    }

    /// A restartable iterator over single-frame stacks, layered on the
    /// eager encoder.
    pub fn frames(&self) -> Frames<'_> {
        Frames { coding: self, t: 0 }
    }

    /// Renders physical frame `t` into `out` (`px * channels` values).
    fn render_physical(&self, t: usize, views: &[SetView], out: &mut [f64]) {
        let params = self.params();
        let derived = self.derived();
        let px = params.height * params.width;
        let bias = derived.bias;

        match params.multiplex {
            Multiplex::Temporal => {
                let (view, shot) = locate(views, t);
                self.render_base(view, shot, out);
            }
            Multiplex::Spatial => {
                let half = derived.base_frame_count / 2;
                let mut second = vec![0.0; px];
                let (view, shot) = locate(views, t);
                self.render_base(view, shot, out);
                let (view, shot) = locate(views, half + t);
                self.render_base(view, shot, &mut second);
                for (o, s) in out.iter_mut().zip(second.iter()) {
                    *o += s - bias;
                }
            }
            Multiplex::Wavelength => {
                let channels = derived.channels;
                let mut plane = vec![0.0; px];
                for (j, view) in views.iter().enumerate() {
                    self.render_base(view, t, &mut plane);
                    for p in 0..px {
                        out[p * channels + j] = plane[p];
                    }
                }
            }
            Multiplex::Frequency => {
                let mut plane = vec![0.0; px];
                for (j, view) in views.iter().enumerate() {
                    self.render_base(view, t, &mut plane);
                    let offset = if j > 0 { bias } else { 0.0 };
                    for p in 0..px {
                        out[p] += plane[p] - offset;
                    }
                }
            }
        }
    }

    /// Renders shot `n` of one coding set: the base sinusoid
    /// `A + B·cos(2π·x/λ − θ_n − p0)` with the display gamma applied.
    fn render_base(&self, view: &SetView, shot: usize, out: &mut [f64]) {
        let params = self.params();
        let derived = self.derived();
        let set = params.sets[view.direction][view.set];
        let theta = view.angles[shot];

        let imax = params.dtype.max_value();
        let bias = derived.bias;
        let amplitude = derived.amplitude;
        let gamma = params.gamma;

        let axis = self.direction_axis(view.direction);
        let len = if axis == 0 {
            params.width
        } else {
            params.height
        };
        let line: Vec<f64> = (0..len)
            .map(|c| {
                let phase = TAU * c as f64 / set.period - theta - params.phase_offset;
                let value = (bias + amplitude * phase.cos()) / imax;
                imax * value.max(0.0).powf(gamma)
            })
            .collect();

        let width = params.width;
        for (row, chunk) in out.chunks_mut(width).enumerate() {
            match axis {
                0 => chunk.copy_from_slice(&line),
                _ => chunk.fill(line[row]),
            }
        }
    }
}

/// Base frame location: the set view owning it and the shot index within.
fn locate<'a>(views: &'a [SetView], base_index: usize) -> (&'a SetView, usize) {
    for view in views {
        if let Some(n) = view.frames.iter().position(|&f| f == base_index) {
            return (view, n);
        }
    }
    unreachable!("base frame index is covered by the set views")
}

/// Restartable, finite sequence of single-frame stacks.
pub struct Frames<'a> {
    coding: &'a Coding,
    t: usize,
}

impl Iterator for Frames<'_> {
    type Item = FrameStack;

    fn next(&mut self) -> Option<Self::Item> {
        if self.t >= self.coding.derived().frame_count {
            return None;
        }

        let frame = self
            .coding
            .encode_frames(&[self.t])
            .expect("frame index is within the sequence");
        self.t += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.coding.derived().frame_count - self.t;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Frames<'_> {}

/// Estimates the display response exponent from a captured stack and
/// returns the linearized stack together with the estimate.
///
/// The median intensity of a full shift sequence exposes the response
/// curve: a linear display leaves it at half range.
pub fn gamma_auto_correct(stack: &FrameStack) -> (FrameStack, f64) {
    let imax = stack.dtype().max_value();
    let mut values = stack.to_f64();

    let mut sorted: Vec<f64> = values
        .iter()
        .map(|&v| v / imax)
        .filter(|v| v.is_finite())
        .collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("values are finite"));
    let median = if sorted.is_empty() {
        0.5
    } else {
        sorted[sorted.len() / 2]
    };

    let gamma = if median > 0.0 && median < 1.0 {
        median.ln() / 0.5f64.ln()
    } else {
        1.0
    };

    let inv = 1.0 / gamma;
    values
        .par_iter_mut()
        .for_each(|v| *v = (*v / imax).max(0.0).powf(inv) * imax);

    let corrected = FrameStack::from_f64(
        stack.frames(),
        stack.height(),
        stack.width(),
        stack.channels(),
        stack.dtype(),
        values,
    )
    .expect("shape is unchanged");
    (corrected, gamma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Params, SetSpec};
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn coding(width: usize, height: usize, shifts: usize, period: f64) -> Coding {
        let params = Params {
            width,
            height,
            sets: vec![vec![SetSpec::new(shifts, period)]],
            axis: 0,
            lmin: 3.0,
            ..Params::default()
        };
        Coding::new(params).unwrap()
    }

    #[test]
    fn encode_is_deterministic() {
        let coding = coding(32, 8, 4, 8.0);
        assert_eq!(coding.encode(), coding.encode());
    }

    #[test]
    fn stack_shape_follows_derived() {
        let coding = coding(32, 8, 4, 8.0);
        let stack = coding.encode();
        assert_eq!(stack.frames(), 4);
        assert_eq!(stack.height(), 8);
        assert_eq!(stack.width(), 32);
        assert_eq!(stack.channels(), 1);
    }

    #[test]
    fn frame_iterator_matches_eager_stack() {
        let coding = coding(16, 4, 4, 8.0);
        let eager = coding.encode().to_f64();
        let frame_px = 16 * 4;

        assert_eq!(coding.frames().len(), 4);
        for (t, frame) in coding.frames().enumerate() {
            assert_eq!(frame.frames(), 1);
            assert_eq!(
                frame.to_f64(),
                eager[t * frame_px..(t + 1) * frame_px].to_vec()
            );
        }

        // Restartable: a second pass yields the same sequence.
        assert_eq!(coding.frames().count(), 4);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    fn single_frame_subset(#[case] t: usize) {
        let coding = coding(16, 4, 4, 8.0);
        let eager = coding.encode().to_f64();
        let frame = coding.encode_frames(&[t]).unwrap().to_f64();
        let frame_px = 16 * 4;
        assert_eq!(frame, eager[t * frame_px..(t + 1) * frame_px].to_vec());
    }

    #[test]
    fn frame_index_out_of_range() {
        let coding = coding(16, 4, 4, 8.0);
        assert!(coding.encode_frames(&[4]).is_err());
    }

    #[test]
    fn shifted_frames_differ() {
        let coding = coding(32, 4, 4, 16.0);
        let stack = coding.encode().to_f64();
        let px = 32 * 4;
        assert_ne!(stack[0..px], stack[px..2 * px]);
    }

    #[test]
    fn gamma_estimate_recovers_applied_exponent() {
        let params = Params {
            width: 64,
            height: 64,
            sets: vec![vec![SetSpec::new(4, 16.0)]],
            gamma: 2.2,
            dtype: crate::stack::Dtype::F64,
            lmin: 3.0,
            ..Params::default()
        };
        let stack = Coding::new(params).unwrap().encode();
        let (_, gamma) = gamma_auto_correct(&stack);
        assert_relative_eq!(gamma, 2.2, max_relative = 0.05);
    }
}
