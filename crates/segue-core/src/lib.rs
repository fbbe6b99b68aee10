//! # segue-core
//!
//! Core types, configuration, and error handling for the Segue audio player.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, ResamplerQuality};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
