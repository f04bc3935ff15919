//! Low-level binary access for class files.
//!
//! - [`crate::file::parser::Parser`] - Bounds-checked cursor used by every decoder in the crate
//! - [`crate::file::io`] - Big-endian primitive conversion and output helpers

pub mod io;
pub mod parser;
