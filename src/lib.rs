#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(clippy::float_arithmetic)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod agent;
pub mod config;
pub mod error;
pub mod image;
pub mod session;
pub mod store;
pub mod stream;
pub mod trigger;
