use crate::error::Error;
use rayon::prelude::*;

/// Element type of an encoded fringe pattern stack.
///
/// Integer types span `[0, max]`; float types span `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    U8,
    U16,
    F32,
    F64,
}

impl Dtype {
    /// Maximum representable intensity.
    pub fn max_value(self) -> f64 {
        match self {
            Dtype::U8 => f64::from(u8::MAX),
            Dtype::U16 => f64::from(u16::MAX),
            Dtype::F32 | Dtype::F64 => 1.0,
        }
    }

    /// Quantization step size (least significant bit).
    pub fn quantum(self) -> f64 {
        match self {
            Dtype::U8 | Dtype::U16 => 1.0,
            Dtype::F32 => f64::from(f32::EPSILON),
            Dtype::F64 => f64::EPSILON,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Dtype::U8 | Dtype::U16)
    }
}

impl Default for Dtype {
    fn default() -> Self {
        Dtype::U8
    }
}

/// Pixel storage of a [`FrameStack`], tagged by element type.
#[derive(Clone, Debug, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Pixels {
    fn len(&self) -> usize {
        match self {
            Pixels::U8(v) => v.len(),
            Pixels::U16(v) => v.len(),
            Pixels::F32(v) => v.len(),
            Pixels::F64(v) => v.len(),
        }
    }

    fn dtype(&self) -> Dtype {
        match self {
            Pixels::U8(_) => Dtype::U8,
            Pixels::U16(_) => Dtype::U16,
            Pixels::F32(_) => Dtype::F32,
            Pixels::F64(_) => Dtype::F64,
        }
    }

    /// Quantizes floating point intensities into the given element type,
    /// rounding to nearest and clipping to the legal range.
    fn quantize(values: Vec<f64>, dtype: Dtype) -> Pixels {
        let max = dtype.max_value();
        match dtype {
            Dtype::U8 => Pixels::U8(
                values
                    .into_par_iter()
                    .map(|v| v.clamp(0.0, max).round() as u8)
                    .collect(),
            ),
            Dtype::U16 => Pixels::U16(
                values
                    .into_par_iter()
                    .map(|v| v.clamp(0.0, max).round() as u16)
                    .collect(),
            ),
            Dtype::F32 => Pixels::F32(
                values
                    .into_par_iter()
                    .map(|v| v.clamp(0.0, max) as f32)
                    .collect(),
            ),
            Dtype::F64 => Pixels::F64(values.into_par_iter().map(|v| v.clamp(0.0, max)).collect()),
        }
    }

    fn to_f64(&self) -> Vec<f64> {
        match self {
            Pixels::U8(v) => v.par_iter().map(|&p| f64::from(p)).collect(),
            Pixels::U16(v) => v.par_iter().map(|&p| f64::from(p)).collect(),
            Pixels::F32(v) => v.par_iter().map(|&p| f64::from(p)).collect(),
            Pixels::F64(v) => v.clone(),
        }
    }
}

/// An ordered sequence of fringe pattern frames of identical spatial shape.
///
/// Values are stored frame-major in `(frame, row, column, channel)` order,
/// matching the order a camera delivers a capture sequence in. The stack is
/// owned by the caller once encoding returns; decoding borrows it and never
/// retains a reference.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameStack {
    frames: usize,
    height: usize,
    width: usize,
    channels: usize,
    pixels: Pixels,
}

impl FrameStack {
    /// Builds a stack by quantizing floating point intensities to `dtype`.
    ///
    /// Intensities are rounded to nearest (integer types) and clipped to the
    /// legal range of `dtype`.
    pub fn from_f64(
        frames: usize,
        height: usize,
        width: usize,
        channels: usize,
        dtype: Dtype,
        values: Vec<f64>,
    ) -> Result<Self, Error> {
        let expected = frames * height * width * channels;
        if values.len() != expected {
            return Err(Error::ShapeMismatch {
                what: "elements",
                expected,
                actual: values.len(),
            });
        }

        Ok(Self {
            frames,
            height,
            width,
            channels,
            pixels: Pixels::quantize(values, dtype),
        })
    }

    /// Wraps already-typed pixel storage.
    pub fn from_pixels(
        frames: usize,
        height: usize,
        width: usize,
        channels: usize,
        pixels: Pixels,
    ) -> Result<Self, Error> {
        let expected = frames * height * width * channels;
        if pixels.len() != expected {
            return Err(Error::ShapeMismatch {
                what: "elements",
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self {
            frames,
            height,
            width,
            channels,
            pixels,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn dtype(&self) -> Dtype {
        self.pixels.dtype()
    }

    pub fn pixels(&self) -> &Pixels {
        &self.pixels
    }

    /// Converts the stack to a flat `f64` buffer in storage order.
    pub fn to_f64(&self) -> Vec<f64> {
        self.pixels.to_f64()
    }

    /// Rearranges a line-interleaved capture back into a frame-major stack.
    ///
    /// A line scan acquisition that advances the object by one row per
    /// displayed frame interleaves the rows of all `frames` patterns. The
    /// total row count must be divisible by `frames`; the result has
    /// `rows / frames` rows per frame.
    pub fn deinterlace(&self, frames: usize) -> Result<FrameStack, Error> {
        let rows = self.frames * self.height;
        if frames == 0 || rows % frames != 0 {
            return Err(Error::ShapeMismatch {
                what: "interleaved rows",
                expected: frames,
                actual: rows,
            });
        }

        let groups = rows / frames;
        let row_len = self.width * self.channels;
        let values = self.to_f64();
        let mut out = vec![0.0; values.len()];
        for g in 0..groups {
            for t in 0..frames {
                let src = (g * frames + t) * row_len;
                let dst = (t * groups + g) * row_len;
                out[dst..dst + row_len].copy_from_slice(&values[src..src + row_len]);
            }
        }

        FrameStack::from_f64(frames, groups, self.width, self.channels, self.dtype(), out)
    }

    /// Inverse of [`FrameStack::deinterlace`]: interleaves the rows of all
    /// frames in acquisition order.
    pub fn interlace(&self) -> FrameStack {
        let rows = self.frames * self.height;
        let row_len = self.width * self.channels;
        let values = self.to_f64();
        let mut out = vec![0.0; values.len()];
        for t in 0..self.frames {
            for g in 0..self.height {
                let src = (t * self.height + g) * row_len;
                let dst = (g * self.frames + t) * row_len;
                out[dst..dst + row_len].copy_from_slice(&values[src..src + row_len]);
            }
        }

        FrameStack::from_f64(rows, 1, self.width, self.channels, self.dtype(), out)
            .expect("interlacing preserves the element count")
    }
}

/// A per-pixel map produced by the decoding pipeline.
///
/// Every stage allocates its own `Field` output; inputs are never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    height: usize,
    width: usize,
    data: Vec<f64>,
}

impl Field {
    pub fn filled(height: usize, width: usize, value: f64) -> Self {
        Self {
            height,
            width,
            data: vec![value; height * width],
        }
    }

    pub fn from_vec(height: usize, width: usize, data: Vec<f64>) -> Result<Self, Error> {
        if data.len() != height * width {
            return Err(Error::ShapeMismatch {
                what: "elements",
                expected: height * width,
                actual: data.len(),
            });
        }

        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col]
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.width + col] = value;
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }
}

/// Per-pixel decode condition flags.
pub mod flag {
    /// Modulation below the usability threshold; phase is unreliable.
    pub const LOW_MODULATION: u8 = 1 << 0;
    /// The fringe order could not be uniquely resolved.
    pub const AMBIGUOUS: u8 = 1 << 1;
    /// The combined coordinate fell outside the unambiguous range.
    pub const OUT_OF_RANGE: u8 = 1 << 2;
    /// No phase information; the pixel was excluded from spatial unwrapping.
    pub const MASKED: u8 = 1 << 3;
    /// The coordinate is only relative (spatially unwrapped map).
    pub const RELATIVE: u8 = 1 << 4;
}

/// Per-pixel bitmask accompanying a decoded coordinate map.
#[derive(Clone, Debug, PartialEq)]
pub struct Flags {
    height: usize,
    width: usize,
    data: Vec<u8>,
}

impl Flags {
    pub fn empty(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0; height * width],
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.width + col]
    }

    pub fn is_set(&self, row: usize, col: usize, bit: u8) -> bool {
        self.get(row, col) & bit != 0
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, bit: u8) {
        self.data[row * self.width + col] |= bit;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of pixels carrying `bit`.
    pub fn count(&self, bit: u8) -> usize {
        self.data.iter().filter(|&&f| f & bit != 0).count()
    }
}
