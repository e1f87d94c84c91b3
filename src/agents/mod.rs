//! Agents shipped with the crate.

pub mod console;
