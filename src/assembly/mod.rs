//! JVM bytecode decoding, patch emission and code relocation.
//!
//! # Key Types
//! - [`Instruction`] - A decoded instruction with absolute branch targets
//! - [`PatchEncoder`] / [`Patch`] - Label-based emission with stack-depth tracking
//! - [`InstructionStream`] - Splices patches into a method body and lays it out again
//!
//! # Example
//! ```rust
//! use hotswap::assembly::{decode_all, opcodes::*};
//!
//! let instructions = decode_all(&[ICONST_1, IRETURN])?;
//! assert_eq!(instructions[1].offset, 1);
//! # Ok::<(), hotswap::Error>(())
//! ```

pub mod encoder;
pub mod instruction;
pub mod opcodes;
pub mod stream;

pub use encoder::{Patch, PatchEncoder};
pub use instruction::{decode, decode_all, Instruction, Operands};
pub use stream::InstructionStream;
