// #![warn(missing_docs)]

//! Phase-Shifting Fringe Pattern Utilities
//!
//! Encode sequences of phase-shifted sinusoidal fringe patterns, and decode
//! captured sequences back into per-pixel screen coordinates with quality
//! and uncertainty maps.
//!
//! The pipeline runs [`params::Params`] → [`params::Coding`] →
//! [`params::Coding::encode`] → capture → [`params::Coding::decode`].

pub mod decode;
pub mod encode;
pub mod error;
pub mod grid;
pub mod io;
pub mod mux;
pub mod params;
pub mod phase;
pub mod sim;
pub mod stack;

mod register;
mod unwrap;

pub mod prelude {
    pub use crate::decode::{DecodeOptions, Decoded, Verbose};
    pub use crate::error::Error;
    pub use crate::mux::Multiplex;
    pub use crate::params::{Coding, FusionMode, Params, SensorModel, SetSpec};
    pub use crate::phase::Phase;
    pub use crate::stack::{flag, Dtype, Field, Flags, FrameStack};
}
