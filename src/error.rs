use thiserror::Error;

use crate::classfile::UnitId;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants line up with the failure taxonomy of the rewriting engine:
///
/// ## Format errors (fatal for the unit, nothing is rewritten)
/// - [`Error::Malformed`] - Corrupted or invalid class-file structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of the input
/// - [`Error::UnsupportedVersion`] - Class-file version newer than the engine understands
/// - [`Error::Empty`] - Empty input provided
///
/// ## Rewrite errors
/// - [`Error::RewriteFault`] - One rewriter failed; the pipeline isolates and logs it
/// - [`Error::Repair`] - Stack-map repair failed for a reason that cannot be stubbed out
/// - [`Error::SymbolTableFull`] / [`Error::CodeTooLarge`] - Format limits exceeded by a rewrite
///
/// ## Host and collaborator errors
/// - [`Error::HostRejected`] - The host runtime refused to load a rewritten unit
/// - [`Error::Resolution`] - Eager resolution of a type failed (logged only)
/// - [`Error::Activation`] - An extension hook could not be created (logged only)
/// - [`Error::FileError`] - Filesystem I/O errors (debug dump)
#[derive(Error, Debug)]
pub enum Error {
    /// The class file is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    #[error("Out of Bound read would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// The class-file major version is outside the supported range.
    #[error("Unsupported class-file version {major}.{minor}")]
    UnsupportedVersion {
        /// Major version found in the header
        major: u16,
        /// Minor version found in the header
        minor: u16,
    },

    /// Appending another symbol would exceed the 65535 slot limit of the symbol table.
    #[error("Symbol table is full")]
    SymbolTableFull,

    /// A rewritten method body exceeds the 65535 byte code-length limit.
    #[error("Code of method {method} grew to {size} bytes")]
    CodeTooLarge {
        /// Name and descriptor of the offending method
        method: String,
        /// Size of the rewritten code array
        size: usize,
    },

    /// An individual rewriter failed.
    ///
    /// The pipeline never propagates this to the host; it is logged and the rewriter is
    /// treated as having made no change.
    #[error("Rewriter '{rewriter}' failed: {message}")]
    RewriteFault {
        /// Name of the failing rewriter
        rewriter: &'static str,
        /// Description of the failure
        message: String,
    },

    /// Stack-map repair of a modified method failed and could not be converted into a
    /// failure stub.
    #[error("Repair of {method} failed: {source}")]
    Repair {
        /// Name and descriptor of the method being repaired
        method: String,
        /// The underlying repair failure
        #[source]
        source: RepairError,
    },

    /// The host runtime refused to load a rewritten unit.
    #[error("Host rejected {unit}: {message}")]
    HostRejected {
        /// Identity of the rejected unit
        unit: UnitId,
        /// The host's diagnostic
        message: String,
    },

    /// Eager resolution of referenced types failed.
    #[error("Resolution of {types:?} failed: {message}")]
    Resolution {
        /// The types that were being resolved
        types: Vec<String>,
        /// The host's diagnostic
        message: String,
    },

    /// An extension reaction hook or selector could not be created.
    #[error("Activation of extension '{extension}' failed: {message}")]
    Activation {
        /// The reaction-hook name of the extension
        extension: String,
        /// Description of the failure
        message: String,
    },

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

/// Failures of the stack-map repair pass.
///
/// [`RepairError::MissingType`] is the resolvable kind: the pipeline replaces the
/// offending method with a stub that raises the failure lazily. Every other variant is
/// unresolvable and aborts the unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepairError {
    /// A type needed to merge two frames could not be resolved.
    #[error("{0}")]
    MissingType(String),

    /// The instruction stream cannot be given consistent frames.
    #[error("invalid code at offset {offset}: {message}")]
    Invalid {
        /// Bytecode offset at which the inconsistency was found
        offset: u32,
        /// Description of the inconsistency
        message: String,
    },
}

impl RepairError {
    /// Returns `true` if the failure stems from a type that could not be resolved.
    #[must_use]
    pub fn is_missing_type(&self) -> bool {
        matches!(self, RepairError::MissingType(_))
    }
}
