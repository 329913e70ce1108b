use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};

use crate::params::{Coding, SensorModel};
use crate::stack::FrameStack;

impl Coding {
    /// Encodes the sequence and simulates its acquisition through the
    /// configured sensor, reproducibly for a fixed `seed`.
    pub fn encode_simulated(&self, seed: u64) -> FrameStack {
        simulate(&self.encode(), &self.params().sensor, seed)
    }
}

/// Simulates the transmission channel: defocus blur from the point spread
/// function, shot noise scaled by the system gain, dark current and dark
/// noise, clipping and requantization.
///
/// Deterministic for a fixed `seed`; an all-zero sensor model reduces this
/// to a requantization pass.
pub fn simulate(stack: &FrameStack, sensor: &SensorModel, seed: u64) -> FrameStack {
    let mut values = stack.to_f64();
    let height = stack.height();
    let width = stack.width();
    let channels = stack.channels();
    let imax = stack.dtype().max_value();

    if sensor.psf > 0.0 {
        let plane = height * width * channels;
        for t in 0..stack.frames() {
            blur_frame(
                &mut values[t * plane..(t + 1) * plane],
                height,
                width,
                channels,
                sensor.psf,
            );
        }
    }

    if sensor.gain > 0.0 {
        let mut rng = StdRng::seed_from_u64(seed);
        let sqrt_gain = sensor.gain.sqrt();

        // Shot noise: the deviation of a Poisson draw around the expected
        // intensity, scaled by the gain.
        for v in values.iter_mut() {
            if *v > 0.0 {
                let draw = Poisson::new(*v)
                    .expect("intensity is positive")
                    .sample(&mut rng);
                *v += (draw - *v) * sqrt_gain;
            }
        }

        let dark_mean = sensor.dark_current * sensor.gain;
        let dark_sigma = sensor.dark_noise * sensor.gain;
        if dark_mean > 0.0 || dark_sigma > 0.0 {
            let dark = Normal::new(dark_mean, dark_sigma)
                .expect("dark noise deviation is non-negative");
            for v in values.iter_mut() {
                *v += dark.sample(&mut rng);
            }
        }
    }

    for v in values.iter_mut() {
        *v = v.clamp(0.0, imax);
    }

    debug!(
        "simulated acquisition: psf = {}, gain = {}",
        sensor.psf, sensor.gain
    );
    FrameStack::from_f64(
        stack.frames(),
        height,
        width,
        channels,
        stack.dtype(),
        values,
    )
    .expect("shape is unchanged")
}

/// Separable Gaussian blur of one frame, applied per channel with edge
/// replication.
fn blur_frame(frame: &mut [f64], height: usize, width: usize, channels: usize, sigma: f64) {
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= norm);

    let mut scratch = vec![0.0; height.max(width)];
    for c in 0..channels {
        // Rows.
        for y in 0..height {
            for x in 0..width {
                let mut acc = 0.0;
                for (i, &k) in kernel.iter().enumerate() {
                    let xi = (x as i64 + i as i64 - radius).clamp(0, width as i64 - 1);
                    acc += k * frame[(y * width + xi as usize) * channels + c];
                }
                scratch[x] = acc;
            }
            for x in 0..width {
                frame[(y * width + x) * channels + c] = scratch[x];
            }
        }
        // Columns.
        for x in 0..width {
            for y in 0..height {
                let mut acc = 0.0;
                for (i, &k) in kernel.iter().enumerate() {
                    let yi = (y as i64 + i as i64 - radius).clamp(0, height as i64 - 1);
                    acc += k * frame[(yi as usize * width + x) * channels + c];
                }
                scratch[y] = acc;
            }
            for y in 0..height {
                frame[(y * width + x) * channels + c] = scratch[y];
            }
        }
    }
}
