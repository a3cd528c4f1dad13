#![cfg_attr(test, allow(clippy::expect_used))]

//! Steward Shared Types and Utilities
//!
//! Types, errors, and utilities shared across the Steward church-management platform.

pub mod db;
pub mod error;
pub mod tenant;

pub use db::*;
pub use error::*;
pub use tenant::*;
