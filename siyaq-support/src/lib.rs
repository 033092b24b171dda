//! # Siyaq Support
//!
//! Shared utilities for the Siyaq crates.
//!
//! This crate provides:
//! - Text rendering for diagnostics (resolution paths, type names, hints)
//! - Tracing bootstrap for binaries and demos

pub mod rendering;
pub mod telemetry;
