//! Shared helpers for the operator binaries.

pub mod bootstrap;
