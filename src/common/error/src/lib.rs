//! Error types and result aliases for Strata.
//!
//! This module provides the core error handling infrastructure shared by
//! every Strata crate.

mod error;

pub use error::{GenericError, StrataError, StrataResult};
