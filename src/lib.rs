// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # hotswap
//!
//! A class-file rewriting engine that lets a running JVM replace loaded types in place.
//!
//! The JVM refuses structural changes to a loaded type: no new fields, no new methods, no
//! changed layout. `hotswap` sits in the class-loading hook and rewrites every unit on its
//! way in so that those changes can still be expressed. Accesses to members that cannot
//! exist on the loaded type are redirected through stable runtime helpers, the verification
//! metadata of every touched method is rebuilt, and redefinitions are batched so that the
//! code reacting to them runs once per burst instead of once per type.
//!
//! ## Features
//!
//! - **Byte-exact class files** - Untouched units serialize to their input; rewritten
//!   units only ever append to the symbol table
//! - **Stack-neutral patches** - Every substitution is checked to have the stack effect of
//!   the instruction it replaces, on both the redirected and the original path
//! - **Frame repair** - `max_stack` and `StackMapTable` are recomputed by abstract
//!   interpretation; methods that cannot be repaired yet fail lazily at call time
//! - **Debounced notification** - Redefinitions are delivered in settled batches once
//!   background verification is done
//! - **Lazy extensions** - Framework integrations activate the first time their trigger
//!   type is loaded
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hotswap::prelude::*;
//!
//! struct Host;
//!
//! impl HostRuntime for Host {
//!     fn describe_type(&self, _loader: LoaderId, _name: &str) -> Option<TypeInfo> {
//!         None
//!     }
//!     fn resolve_types(&self, _loader: LoaderId, _types: &[String]) -> hotswap::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let pipeline = PipelineBuilder::new(Arc::new(Host))
//!     .config(EngineConfig::from_env())
//!     .policy(Arc::new(PrefixPolicy::new(["com.example."])))
//!     .build()?;
//!
//! // a field added to a loaded type becomes a standing redirect
//! pipeline.add_field("com/example/Service", "count", "I", LoaderId(1));
//! # Ok::<(), hotswap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - Bounds-checked big-endian reading and writing
//! - [`classfile`] - The compiled unit: symbol table, members, `Code` attributes
//! - [`assembly`] - Instruction decoding, patch encoding and the relocating instruction stream
//! - [`analysis`] - Frame repair and the failure stub
//! - [`rewrite`] - The redirection rewriters and their rule indices
//! - [`pipeline`] - The per-unit driver and its collaborators
//! - [`scheduler`] - Batching and debouncing of redefinition notifications
//! - [`extension`] - Lazy activation of extensions
//! - [`config`] - Engine configuration
//!
//! ## Error Handling
//!
//! Every fallible operation returns [`Result`]; see [`Error`] for the failure taxonomy.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Low-level binary access.
pub mod file;

/// The compiled-unit model.
///
/// Parses and writes JVM class files. The symbol table is append-only so indices captured
/// before a rewrite stay valid after it.
pub mod classfile;

/// Instruction-level tools.
///
/// - [`assembly::instruction`] - Decoding and encoding of single instructions
/// - [`assembly::encoder::PatchEncoder`] - Emits patches with labels and stack tracking
/// - [`assembly::stream::InstructionStream`] - Splices patches into a method and relocates
///   every branch, switch and table entry
pub mod assembly;

/// Repair of verification metadata for rewritten methods.
pub mod analysis;

/// Redirection rewriters.
pub mod rewrite;

/// The rewriting pipeline.
pub mod pipeline;

/// Redefinition batching.
pub mod scheduler;

/// Extension activation.
pub mod extension;

/// Engine configuration.
pub mod config;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use hotswap::prelude::*;
///
/// let unit = CompiledUnit::parse(&std::fs::read("Service.class")?)?;
/// println!("{} methods", unit.methods.len());
/// # Ok::<(), hotswap::Error>(())
/// ```
pub mod prelude;

pub use error::{Error, RepairError};

/// `hotswap` Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Bounds-checked big-endian cursor over a byte slice.
pub use file::parser::Parser;
