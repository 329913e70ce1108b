use std::f64::consts::TAU;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mux::Multiplex;
use crate::stack::Dtype;

/// Tolerance below which a period is treated as an integer number of pixels.
const PERIOD_ATOL: f64 = 1e-9;

/// Largest integer exactly representable in an `f64`; an LCM beyond this is
/// not representable in the working precision.
const MAX_EXACT: u128 = 1 << 53;

/// One coding set: a sinusoidal fringe pattern of a single spatial period,
/// sampled with `shifts` temporal phase shifts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetSpec {
    /// Number of temporal phase shifts N.
    pub shifts: usize,

    /// Spatial period of the fringes, in px.
    pub period: f64,

    /// Temporal carrier frequency: the number of periods the pattern moves
    /// over one full shift cycle. Stays 1 except under frequency
    /// multiplexing.
    #[serde(default = "one")]
    pub carrier: f64,
}

fn one() -> f64 {
    1.0
}

impl SetSpec {
    pub fn new(shifts: usize, period: f64) -> Self {
        Self {
            shifts,
            period,
            carrier: 1.0,
        }
    }

    /// Temporal shift angles of this set, in radians.
    ///
    /// Sets with two shifts use quarter-period spacing so that phase can
    /// still be solved once the bias is known.
    pub(crate) fn shift_angles(&self, carrier: f64, reverse: bool) -> Vec<f64> {
        let denom = if self.shifts == 2 {
            4.0
        } else {
            self.shifts as f64
        };
        let sign = if reverse { -1.0 } else { 1.0 };
        (0..self.shifts)
            .map(|n| sign * TAU * carrier * n as f64 / denom)
            .collect()
    }
}

/// How per-set position estimates are fused into one coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMode {
    /// Use the coarsest reliable set only.
    Fast,
    /// Inverse-variance weighted average over all sets.
    Precise,
}

impl Default for FusionMode {
    fn default() -> Self {
        FusionMode::Fast
    }
}

/// Radiometric model of the capturing camera, used for noise propagation
/// and for acquisition simulation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorModel {
    /// Overall system gain, in DN per electron. Zero disables shot noise.
    pub gain: f64,
    /// Dark (read) noise standard deviation, in electrons.
    pub dark_noise: f64,
    /// Dark current, in electrons.
    pub dark_current: f64,
    /// Point spread function standard deviation, in px.
    pub psf: f64,
    /// Dark signal offset, in DN.
    pub dark_signal: f64,
}

impl Default for SensorModel {
    fn default() -> Self {
        Self {
            gain: 0.0,
            dark_noise: 0.0,
            dark_current: 0.0,
            psf: 0.0,
            dark_signal: 0.0,
        }
    }
}

/// The full coding configuration.
///
/// `Params` is plain data; nothing is derived or validated until it is
/// turned into a [`Coding`]. Mutating a configuration means building a new
/// `Params` and calling [`Coding::new`] again — there are no implicit
/// attribute observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Pattern height Y, in px.
    pub height: usize,
    /// Pattern width X, in px.
    pub width: usize,
    /// Coding sets per direction; the outer length is the direction count D.
    pub sets: Vec<Vec<SetSpec>>,
    /// Image axis along which a single direction codes: 0 = columns,
    /// 1 = rows. Ignored for two directions.
    pub axis: usize,
    /// Active multiplexing mode.
    pub multiplex: Multiplex,
    /// Quantization target of encoded frames.
    pub dtype: Dtype,
    /// Relative bias (mean exposure) β ∈ (0, 1].
    pub beta: f64,
    /// Fringe visibility (contrast) V ∈ (0, 1].
    pub visibility: f64,
    /// Global phase offset p0, in radians, within (-2π, 2π).
    pub phase_offset: f64,
    /// Display gamma pre-correction exponent.
    pub gamma: f64,
    /// Shift the fringes in reverse direction.
    pub reverse: bool,
    /// Minimum resolvable period, in px.
    pub lmin: f64,
    /// Minimum visibility for a pixel to count as reliable.
    pub vmin: f64,
    /// Coordinate fusion mode.
    pub mode: FusionMode,
    /// Camera noise model.
    pub sensor: SensorModel,
}

impl Default for Params {
    fn default() -> Self {
        let length = 1920.0;
        let sets = vec![
            SetSpec::new(4, length / 13.0),
            SetSpec::new(4, length / 7.0),
            SetSpec::new(4, length / 89.0),
        ];

        Self {
            height: 1200,
            width: 1920,
            sets: vec![sets.clone(), sets],
            axis: 0,
            multiplex: Multiplex::Temporal,
            dtype: Dtype::U8,
            beta: 0.5,
            visibility: 1.0,
            phase_offset: std::f64::consts::PI,
            gamma: 1.0,
            reverse: false,
            lmin: 8.0,
            vmin: 0.0,
            mode: FusionMode::Fast,
            sensor: SensorModel::default(),
        }
    }
}

impl Params {
    /// Number of coded directions.
    pub fn directions(&self) -> usize {
        self.sets.len()
    }

    /// Replaces the coding sets with an optimal period selection for
    /// `target_range` px under `max_frames` captured frames, keeping every
    /// other field. See [`optimal_periods`] for the search rule.
    pub fn optimize(&mut self, target_range: f64, max_frames: usize) -> Result<(), Error> {
        let directions = self.directions().max(1);
        let lmin = self.lmin.ceil().max(3.0) as u64;
        let lmax = (target_range.sqrt().ceil() as u64 * 4).max(lmin + 8);
        let periods = optimal_periods(target_range, lmin, lmax, max_frames, directions)?;

        let shifts = (max_frames / (directions * periods.len())).clamp(3, 1001);
        let sets: Vec<SetSpec> = periods
            .iter()
            .map(|&period| SetSpec::new(shifts, period))
            .collect();
        self.sets = vec![sets; directions];

        debug!(
            "optimized periods = {:?}, shifts = {shifts} for range {target_range}",
            periods
        );
        Ok(())
    }
}

/// Quantities derived from a [`Params`] by [`Coding::new`].
///
/// Recomputed from scratch on every construction; never cached stale.
#[derive(Clone, Debug, PartialEq)]
pub struct Derived {
    /// Number of physically captured frames T.
    pub frame_count: usize,
    /// Number of base (unmultiplexed) frames, the sum of all shifts.
    pub base_frame_count: usize,
    /// Colour channels C of the encoded frames.
    pub channels: usize,
    /// Coding length L: the longest screen extent, in px.
    pub coding_length: f64,
    /// Screen extent per direction, in px.
    pub lengths: Vec<f64>,
    /// Unambiguous measurement range per direction, in px.
    pub umr: Vec<f64>,
    /// Effective temporal carrier per direction and set.
    pub carriers: Vec<Vec<f64>>,
    /// Intensity bias A, in DN.
    pub bias: f64,
    /// Per-set fringe amplitude B after multiplex folding, in DN.
    pub amplitude: f64,
    /// Nominal intensity noise standard deviation, in DN.
    pub intensity_noise: f64,
    /// Nominal coordinate uncertainty per direction, in px.
    pub uncertainty: Vec<f64>,
    /// Signal-to-noise ratio of the coding per direction, linear.
    pub snr: Vec<f64>,
    /// Signal-to-noise ratio per direction, in dB.
    pub snr_db: Vec<f64>,
    /// Dynamic range of the coding per direction, linear.
    pub dynamic_range: Vec<f64>,
    /// Dynamic range per direction, in dB.
    pub dynamic_range_db: Vec<f64>,
    /// True where the unambiguous range does not cover the screen, so
    /// decoding has to fall back to spatial unwrapping.
    pub ambiguous: Vec<bool>,
}

/// A validated coding configuration together with its derived quantities.
///
/// This is the entry point to encoding and decoding. Construction runs the
/// full validation of the parameter set, so every `Coding` is usable.
#[derive(Clone, Debug)]
pub struct Coding {
    params: Params,
    derived: Derived,
}

impl Coding {
    /// Validates `params` and computes all derived quantities.
    pub fn new(params: Params) -> Result<Self, Error> {
        let derived = recompute(&params)?;
        Ok(Self { params, derived })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn derived(&self) -> &Derived {
        &self.derived
    }

    /// Screen-space coordinate of a pixel along direction `d`.
    pub(crate) fn coordinate(&self, d: usize, row: usize, col: usize) -> f64 {
        match self.direction_axis(d) {
            0 => col as f64,
            _ => row as f64,
        }
    }

    /// Image axis that direction `d` codes along.
    pub(crate) fn direction_axis(&self, d: usize) -> usize {
        if self.params.directions() == 1 {
            self.params.axis
        } else {
            d
        }
    }
}

impl From<Coding> for Params {
    fn from(coding: Coding) -> Params {
        coding.params
    }
}

/// Explicit, idempotent derivation of all dependent quantities.
///
/// Pure function of the parameter set; fails with [`Error::Config`] or
/// [`Error::Separability`] when the combination is contradictory.
pub fn recompute(params: &Params) -> Result<Derived, Error> {
    let d_count = params.directions();
    if d_count == 0 || d_count > 2 {
        return Err(Error::config(format!(
            "direction count must be 1 or 2, got {d_count}"
        )));
    }
    if params.height == 0 || params.width == 0 {
        return Err(Error::config("pattern dimensions must be nonzero"));
    }
    if params.axis > 1 {
        return Err(Error::config(format!(
            "axis must be 0 or 1, got {}",
            params.axis
        )));
    }

    let coding_length = params.width.max(params.height) as f64;
    let lengths: Vec<f64> = (0..d_count)
        .map(|d| {
            let axis = if d_count == 1 { params.axis } else { d };
            match axis {
                0 => params.width as f64,
                _ => params.height as f64,
            }
        })
        .collect();

    for (d, sets) in params.sets.iter().enumerate() {
        if sets.is_empty() {
            return Err(Error::config(format!("direction {d} has no coding sets")));
        }
        if !sets.iter().any(|s| s.shifts >= 3) {
            return Err(Error::config(format!(
                "direction {d} needs at least one set with 3 or more shifts \
                 to solve for bias, modulation and position"
            )));
        }
        for (k, set) in sets.iter().enumerate() {
            if set.shifts < 2 {
                return Err(Error::config(format!(
                    "set {k} of direction {d} has {} shifts, minimum is 2",
                    set.shifts
                )));
            }
            if !set.period.is_finite() || set.period <= 0.0 {
                return Err(Error::config(format!(
                    "set {k} of direction {d} has a non-positive period"
                )));
            }
            if set.period < params.lmin {
                return Err(Error::config(format!(
                    "set {k} of direction {d} has period {} below the \
                     resolvable minimum {}",
                    set.period, params.lmin
                )));
            }
        }
    }

    if !(0.0..=1.0).contains(&params.beta) || params.beta == 0.0 {
        return Err(Error::config("beta must be within (0, 1]"));
    }
    if !(0.0..=1.0).contains(&params.visibility) || params.visibility == 0.0 {
        return Err(Error::config("visibility must be within (0, 1]"));
    }
    if params.beta * (1.0 + params.visibility) > 1.0 + 1e-12 {
        return Err(Error::config(
            "beta * (1 + visibility) exceeds the intensity range",
        ));
    }
    if !(0.0..=3.0).contains(&params.gamma) || params.gamma == 0.0 {
        return Err(Error::config("gamma must be within (0, 3]"));
    }
    if params.phase_offset.abs() >= TAU {
        return Err(Error::config("phase offset must be within (-2pi, 2pi)"));
    }
    if !(0.0..1.0).contains(&params.vmin) {
        return Err(Error::config("vmin must be within [0, 1)"));
    }
    if params.lmin < 3.0 {
        return Err(Error::config(
            "lmin below 3 px cannot carry sufficient modulation",
        ));
    }
    let sensor = &params.sensor;
    if !(0.0..=1.0).contains(&sensor.gain)
        || sensor.dark_noise < 0.0
        || sensor.dark_current < 0.0
        || sensor.psf < 0.0
        || !(0.0..=params.dtype.max_value()).contains(&sensor.dark_signal)
    {
        return Err(Error::config("sensor model values are out of range"));
    }

    let base_frame_count: usize = params.sets.iter().flatten().map(|s| s.shifts).sum();
    let set_count: usize = params.sets.iter().map(|s| s.len()).sum();
    let carriers = effective_carriers(params, set_count)?;
    let (frame_count, channels) = fold(params, base_frame_count, set_count, &carriers)?;

    let mut umr = Vec::with_capacity(d_count);
    for sets in &params.sets {
        let periods: Vec<f64> = sets.iter().map(|s| s.period).collect();
        umr.push(umr_of(&periods, coding_length)?);
    }

    let ambiguous: Vec<bool> = umr
        .iter()
        .zip(lengths.iter())
        .map(|(&u, &r)| u + PERIOD_ATOL < r)
        .collect();
    if ambiguous.iter().any(|&a| a) {
        warn!(
            "unambiguous range {:?} does not cover the screen extent {:?}; \
             decoding will fall back to spatial unwrapping",
            umr, lengths
        );
    }

    // Intensity model. The per-set amplitude shrinks by the folding factor
    // so the multiplexed sum still fits the dtype range.
    let imax = params.dtype.max_value();
    let bias = imax * params.beta;
    let fold_amp = match params.multiplex {
        Multiplex::Spatial => d_count as f64,
        Multiplex::Frequency => set_count as f64,
        Multiplex::Temporal | Multiplex::Wavelength => 1.0,
    };
    let amplitude = bias * params.visibility / fold_amp;

    // Noise propagation: intensity noise -> per-set phase uncertainty ->
    // per-set positional uncertainty -> inverse-variance fusion.
    let quant = params.dtype.quantum() / 12f64.sqrt();
    let shot = if params.sensor.gain > 0.0 {
        (params.sensor.gain * (bias - params.sensor.dark_signal).max(0.0)).sqrt()
    } else {
        0.0
    };
    let dark = params.sensor.gain * params.sensor.dark_noise;
    let intensity_noise = (dark * dark + quant * quant + shot * shot).sqrt();

    let mut uncertainty = Vec::with_capacity(d_count);
    for sets in &params.sets {
        let mut inv_var = 0.0;
        for set in sets {
            let b = amplitude * mtf(params.sensor.psf, set.period);
            if b <= 0.0 {
                continue;
            }
            let snr = b / intensity_noise;
            let upi = 2f64.sqrt() / (set.shifts as f64).sqrt() / snr;
            let uxi = upi / TAU * set.period;
            inv_var += 1.0 / (uxi * uxi);
        }
        uncertainty.push((1.0 / inv_var).sqrt());
    }

    let snr: Vec<f64> = lengths
        .iter()
        .zip(uncertainty.iter())
        .map(|(&r, &u)| r / u)
        .collect();
    let dynamic_range: Vec<f64> = umr
        .iter()
        .zip(uncertainty.iter())
        .map(|(&m, &u)| m / u)
        .collect();
    let snr_db: Vec<f64> = snr.iter().map(|&s| 20.0 * s.log10()).collect();
    let dynamic_range_db: Vec<f64> = dynamic_range.iter().map(|&s| 20.0 * s.log10()).collect();

    let derived = Derived {
        frame_count,
        base_frame_count,
        channels,
        coding_length,
        lengths,
        umr,
        carriers,
        bias,
        amplitude,
        intensity_noise,
        uncertainty,
        snr,
        snr_db,
        dynamic_range,
        dynamic_range_db,
        ambiguous,
    };
    debug!(
        "derived: T = {}, C = {}, UMR = {:?}, u = {:?}",
        derived.frame_count, derived.channels, derived.umr, derived.uncertainty
    );
    Ok(derived)
}

/// Effective temporal carriers per direction and set.
///
/// Under frequency multiplexing every set needs its own integer carrier;
/// when the configuration still has the all-ones default, consecutive
/// integers are assigned in direction-major order.
fn effective_carriers(params: &Params, set_count: usize) -> Result<Vec<Vec<f64>>, Error> {
    let user: Vec<Vec<f64>> = params
        .sets
        .iter()
        .map(|sets| sets.iter().map(|s| s.carrier).collect())
        .collect();

    if params.multiplex != Multiplex::Frequency {
        for (d, sets) in params.sets.iter().enumerate() {
            for (k, set) in sets.iter().enumerate() {
                let f = set.carrier;
                if f == 0.0 || !f.is_finite() {
                    return Err(Error::config(format!(
                        "set {k} of direction {d} has carrier 0"
                    )));
                }
                if (f % set.shifts as f64).abs() < PERIOD_ATOL {
                    return Err(Error::config(format!(
                        "carrier of set {k}, direction {d} is a multiple of \
                         its shift count; the pattern would stand still"
                    )));
                }
            }
        }
        return Ok(user);
    }

    let all_default = user.iter().flatten().all(|&f| f == 1.0);
    if all_default {
        let mut next = 1.0;
        return Ok(params
            .sets
            .iter()
            .map(|sets| {
                sets.iter()
                    .map(|_| {
                        let f = next;
                        next += 1.0;
                        f
                    })
                    .collect()
            })
            .collect());
    }

    let mut seen: Vec<u64> = Vec::with_capacity(set_count);
    for (d, sets) in user.iter().enumerate() {
        for (k, &f) in sets.iter().enumerate() {
            if !f.is_finite() || f == 0.0 || (f - f.round()).abs() > PERIOD_ATOL {
                return Err(Error::separability(format!(
                    "carrier of set {k}, direction {d} must be a nonzero integer"
                )));
            }
            let key = f.abs().round() as u64;
            if seen.contains(&key) {
                return Err(Error::separability(format!(
                    "carrier magnitude {key} is used by more than one set; \
                     the matched filters cannot separate them"
                )));
            }
            seen.push(key);
        }
    }
    Ok(user)
}

/// Frame count and channel count after multiplex folding, with the
/// separability checks the chosen mode demands.
fn fold(
    params: &Params,
    base_frame_count: usize,
    set_count: usize,
    carriers: &[Vec<f64>],
) -> Result<(usize, usize), Error> {
    let d_count = params.directions();
    let uniform_shifts = || -> Option<usize> {
        let first = params.sets[0][0].shifts;
        params
            .sets
            .iter()
            .flatten()
            .all(|s| s.shifts == first)
            .then_some(first)
    };

    match params.multiplex {
        Multiplex::Temporal => Ok((base_frame_count, 1)),
        Multiplex::Spatial => {
            if d_count != 2 {
                return Err(Error::separability(
                    "spatial multiplexing needs two directions to fold",
                ));
            }
            let per_dir: Vec<usize> = params
                .sets
                .iter()
                .map(|sets| sets.iter().map(|s| s.shifts).sum())
                .collect();
            if per_dir[0] != per_dir[1] {
                return Err(Error::separability(format!(
                    "spatial multiplexing needs equal shift totals per \
                     direction, got {} and {}",
                    per_dir[0], per_dir[1]
                )));
            }
            let resolution = params.width.min(params.height) as f64 / 2.0;
            for (d, sets) in params.sets.iter().enumerate() {
                for (k, set) in sets.iter().enumerate() {
                    if set.period > resolution {
                        return Err(Error::separability(format!(
                            "period {} of set {k}, direction {d} exceeds the \
                             Fourier resolution {resolution}; its carrier \
                             cannot be separated from the base band",
                            set.period
                        )));
                    }
                }
            }
            Ok((base_frame_count / 2, 1))
        }
        Multiplex::Wavelength => {
            let Some(shifts) = uniform_shifts() else {
                return Err(Error::separability(
                    "wavelength multiplexing needs a uniform shift count",
                ));
            };
            if set_count > 3 {
                return Err(Error::separability(format!(
                    "wavelength multiplexing encodes {set_count} sets but \
                     only 3 spectral channels exist"
                )));
            }
            Ok((shifts, 3))
        }
        Multiplex::Frequency => {
            if set_count < 2 {
                return Err(Error::separability(
                    "frequency multiplexing needs at least two sets to fold",
                ));
            }
            let Some(shifts) = uniform_shifts() else {
                return Err(Error::separability(
                    "frequency multiplexing needs a uniform shift count",
                ));
            };
            let fmax = carriers
                .iter()
                .flatten()
                .fold(0.0f64, |acc, &f| acc.max(f.abs()));
            let needed = (2.0 * fmax + 1.0).ceil() as usize;
            if shifts < needed {
                return Err(Error::separability(format!(
                    "{shifts} shifts undersample the carriers; at least \
                     {needed} are needed for the largest carrier {fmax}"
                )));
            }
            Ok((shifts, 1))
        }
    }
}

/// Gaussian modulation transfer at a given period for a defocus PSF.
fn mtf(psf: f64, period: f64) -> f64 {
    if psf <= 0.0 {
        return 1.0;
    }
    let x = std::f64::consts::PI * psf / period;
    (-2.0 * x * x).exp()
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm_checked(a: u128, b: u128) -> Option<u128> {
    (a / gcd(a, b)).checked_mul(b)
}

/// Power-of-ten scale at which every value becomes integral, if one exists
/// within nine decimals.
fn decimal_scale(values: &[f64]) -> Option<f64> {
    let mut scale = 1.0;
    for _ in 0..=9 {
        if values
            .iter()
            .all(|&v| (v * scale - (v * scale).round()).abs() < PERIOD_ATOL * scale.max(1.0))
        {
            return Some(scale);
        }
        scale *= 10.0;
    }
    None
}

/// Unambiguous measurement range of a period combination: the least common
/// multiple of the periods, in px.
///
/// Integer periods reduce pairwise through the gcd. Rational periods are
/// scaled by a power of ten to a common denominator first and rescaled
/// afterwards; periods whose spatial frequency over `coding_length` is
/// rational instead reduce through the gcd of the frequencies. Period sets
/// where neither representation terminates fall back to the product of the
/// periods. A period that divides another contributes nothing and is
/// dropped up front.
pub fn umr_of(periods: &[f64], coding_length: f64) -> Result<f64, Error> {
    let mut periods: Vec<f64> = periods.to_vec();
    if periods.is_empty() {
        return Ok(1.0);
    }

    // Mutual divisibility: drop any period that divides another.
    let mut keep = vec![true; periods.len()];
    for i in 0..periods.len() {
        for j in 0..periods.len() {
            if i == j || !keep[i] || !keep[j] {
                continue;
            }
            let rem = periods[i] % periods[j];
            if rem < PERIOD_ATOL || periods[j] - rem < PERIOD_ATOL {
                if periods[i] > periods[j] || (periods[i] == periods[j] && i < j) {
                    keep[j] = false;
                }
            }
        }
    }
    let mut idx = 0;
    periods.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });

    if let Some(scale) = decimal_scale(&periods) {
        let mut reduced: u128 = 1;
        for &p in &periods {
            let scaled = (p * scale).round();
            if !scaled.is_finite() || scaled <= 0.0 || scaled >= MAX_EXACT as f64 {
                return Err(Error::config(format!(
                    "period {p} px does not scale to a representable integer"
                )));
            }
            reduced = lcm_checked(reduced, scaled as u128)
                .filter(|&l| l < MAX_EXACT.saturating_mul(1_000_000_000))
                .ok_or_else(|| {
                    Error::config(
                        "least common multiple of the periods overflows the working precision",
                    )
                })?;
        }

        let umr = reduced as f64 / scale;
        if !umr.is_finite() || umr as u128 > MAX_EXACT {
            return Err(Error::config(
                "least common multiple of the periods is not representable",
            ));
        }
        return Ok(umr);
    }

    if coding_length.is_finite() && coding_length > 0.0 {
        let freqs: Vec<f64> = periods.iter().map(|&p| coding_length / p).collect();
        if let Some(scale) = decimal_scale(&freqs) {
            let mut reduced: u128 = 0;
            for &f in &freqs {
                let scaled = (f * scale).round();
                if !scaled.is_finite() || scaled <= 0.0 || scaled >= MAX_EXACT as f64 {
                    return Err(Error::config(format!(
                        "frequency {f} does not scale to a representable integer"
                    )));
                }
                reduced = gcd(reduced, scaled as u128);
            }
            let umr = coding_length * scale / reduced as f64;
            if !umr.is_finite() || umr as u128 > MAX_EXACT {
                return Err(Error::config(
                    "least common multiple of the periods is not representable",
                ));
            }
            return Ok(umr);
        }
    }

    // Neither the periods nor the frequencies terminate; the only safe
    // range left is the product of the periods.
    debug!("periods look irrational, using the product as the range");
    Ok(periods.iter().product())
}

/// Searches for the cheapest coprime period combination whose unambiguous
/// range covers `target_range` px.
///
/// Candidates are explored in increasing total frame cost (directions ×
/// set count × 3 minimum shifts), then in increasing period sum; the first
/// pairwise-coprime combination with lcm ≥ `target_range` wins. Ties on
/// frame cost and period sum break toward the larger range, then the
/// smaller maximum period, then lexicographic order.
pub fn optimal_periods(
    target_range: f64,
    lmin: u64,
    lmax: u64,
    max_frames: usize,
    directions: usize,
) -> Result<Vec<f64>, Error> {
    const MIN_SHIFTS: usize = 3;

    if target_range <= 0.0 || !target_range.is_finite() {
        return Err(Error::config("target range must be positive and finite"));
    }
    if lmin < 3 || lmax < lmin {
        return Err(Error::config(format!(
            "period range [{lmin}, {lmax}] is empty or below the minimum"
        )));
    }

    let mut k = 1;
    while directions * k * MIN_SHIFTS <= max_frames {
        let mut best: Option<(u64, u128, u64, Vec<u64>)> = None;
        let mut combo: Vec<u64> = (0..k as u64).map(|i| lmin + i).collect();
        if combo.last().copied().unwrap_or(0) <= lmax {
            loop {
                if let Some(range) = coprime_range(&combo) {
                    if range as f64 >= target_range {
                        let sum: u64 = combo.iter().sum();
                        let max = *combo.last().expect("combo is nonempty");
                        let candidate = (sum, range, max, combo.clone());
                        let better = match &best {
                            None => true,
                            Some((bsum, brange, bmax, bcombo)) => {
                                (sum, std::cmp::Reverse(range), max, &combo)
                                    < (*bsum, std::cmp::Reverse(*brange), *bmax, bcombo)
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                }
                if !next_combination(&mut combo, lmax) {
                    break;
                }
            }
        }

        if let Some((_, _, _, combo)) = best {
            return Ok(combo.into_iter().map(|p| p as f64).collect());
        }
        k += 1;
    }

    Err(Error::config(format!(
        "no coprime period combination within [{lmin}, {lmax}] px and \
         {max_frames} frames reaches a range of {target_range} px"
    )))
}

/// The lcm of a strictly increasing combination, provided it is pairwise
/// coprime; `None` otherwise.
fn coprime_range(combo: &[u64]) -> Option<u128> {
    for i in 0..combo.len() {
        for j in i + 1..combo.len() {
            if gcd(combo[i] as u128, combo[j] as u128) != 1 {
                return None;
            }
        }
    }
    let mut range: u128 = 1;
    for &p in combo {
        range = range.checked_mul(p as u128)?;
    }
    Some(range)
}

/// Advances a strictly increasing combination within `[.., lmax]`,
/// enumerating by ascending element sum.
fn next_combination(combo: &mut [u64], lmax: u64) -> bool {
    // Lexicographic successor of the increasing combination; the caller
    // compares on the sum, so full enumeration is sufficient here.
    let k = combo.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        let cap = lmax - (k - 1 - i) as u64;
        if combo[i] < cap {
            combo[i] += 1;
            for j in i + 1..k {
                combo[j] = combo[j - 1] + 1;
            }
            return true;
        }
    }
    false
}
