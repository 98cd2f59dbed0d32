//! Crate-internal test support

pub mod helpers;
