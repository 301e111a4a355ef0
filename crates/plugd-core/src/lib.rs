//! # plugd-core
//!
//! Core crate for plugd. Contains the configuration schemas and the unified
//! error system shared by the plugin runtime and the server binary.
//!
//! This crate has **no** internal dependencies on other plugd crates.

pub mod config;
pub mod error;
pub mod result;

pub use error::AppError;
pub use result::AppResult;
