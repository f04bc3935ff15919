//! # hotswap Prelude
//!
//! The types a host integration needs most: the pipeline and its collaborators, the
//! compiled-unit model and the scheduler's notification types.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all hotswap operations
pub use crate::{Error, RepairError};

/// The result type used throughout hotswap
pub use crate::Result;

/// Engine configuration
pub use crate::config::EngineConfig;

// ================================================================================================
// Pipeline
// ================================================================================================

/// Per-unit driver
pub use crate::pipeline::{Pipeline, PipelineBuilder, TransformRequest, Transformed};

/// Collaborators consulted by the pipeline
pub use crate::pipeline::policy::{
    HostRuntime, LoadedTypes, NeverReplaceable, NoLoadedTypes, PrefixPolicy, ReplaceablePolicy,
    ReplaceableSelector,
};

// ================================================================================================
// Compiled units
// ================================================================================================

/// Unit model and identity
pub use crate::classfile::{CompiledUnit, LoaderId, UnitId};

/// Type hierarchy used by frame repair
pub use crate::analysis::{TypeHierarchy, TypeInfo};

// ================================================================================================
// Rewriting
// ================================================================================================

/// Rewriter contract and the core rewriters
pub use crate::rewrite::{
    FieldStorageRewriter, InstanceTrackingRewriter, ReflectiveConstructorRewriter,
    ReflectiveFieldRewriter, RewriteContext, Rewriter, RuntimeTargets,
};

// ================================================================================================
// Notification and extensions
// ================================================================================================

/// Batched redefinition notification
pub use crate::scheduler::{ChangeListener, ChangeNotifier, ChangeScheduler, ChangedUnit, NewUnit};

/// Extension activation
pub use crate::extension::{ActivationGate, Extension, ExtensionRegistry, ReactionHook};
