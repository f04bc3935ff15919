//! Instruction rewriters that redirect member accesses through runtime indirection points.
//!
//! Every concern that cannot be expressed by redefining a loaded type in place gets its own
//! [`Rewriter`]: redirected field storage ([`fields`]), reflective field access and reflective
//! constructor invocation ([`reflection`]) and instance tracking ([`tracking`]). Rewriters
//! share a small amount of machinery:
//!
//! - [`scanner`] walks the symbol table once and lets a rule pick the references it owns
//! - [`rules`] holds the standing rules in copy-on-write indices
//! - [`boxing`] converts between typed operands and `Object`
//! - [`edit_methods`] applies per-instruction patches through the relocating
//!   [`InstructionStream`] and records which methods changed
//!
//! Patches replacing an instruction must have the same stack effect as the instruction on
//! every path; [`check_neutral`] enforces it before anything is spliced.

pub mod boxing;
pub mod fields;
pub mod reflection;
pub mod rules;
pub mod scanner;
pub mod targets;
pub mod tracking;

use std::collections::BTreeSet;

use crate::{
    assembly::{
        encoder::Patch,
        instruction::{decode_all, Instruction},
        stream::InstructionStream,
    },
    classfile::{constants::SymbolTable, CompiledUnit, LoaderId},
    Error, Result,
};

pub use fields::FieldStorageRewriter;
pub use reflection::{ReflectiveConstructorRewriter, ReflectiveFieldRewriter};
pub use targets::RuntimeTargets;
pub use tracking::InstanceTrackingRewriter;

/// Indices of the methods whose code a rewrite pass changed.
pub type ModifiedMethods = BTreeSet<usize>;

/// Per-unit state shared by all rewriters of one pipeline run.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// Loader defining the unit
    pub loader: LoaderId,
    /// `true` when an already loaded type is being redefined
    pub redefinition: bool,
    /// `true` when the unit may itself be redefined later
    pub replaceable: bool,
    /// Methods whose code changed and which need repair
    pub modified_methods: ModifiedMethods,
    /// Types that must be resolved eagerly once the unit is rewritten
    pub eager_resolution: BTreeSet<String>,
}

impl RewriteContext {
    /// Creates a context with no modified methods.
    #[must_use]
    pub fn new(loader: LoaderId, redefinition: bool, replaceable: bool) -> Self {
        RewriteContext {
            loader,
            redefinition,
            replaceable,
            modified_methods: ModifiedMethods::new(),
            eager_resolution: BTreeSet::new(),
        }
    }

    /// Requests that `type_name` be resolved after the unit is rewritten.
    pub fn require_resolution(&mut self, type_name: &str) {
        self.eager_resolution.insert(type_name.to_string());
    }
}

/// One redirection concern.
///
/// Rewriters must be thread-safe: the pipeline runs them for many units at once. A rewriter
/// that fails or panics is isolated by the pipeline and treated as having made no change.
pub trait Rewriter: Send + Sync {
    /// Unique name for logging.
    fn name(&self) -> &'static str;

    /// Get a description of what this rewriter does.
    fn description(&self) -> &'static str {
        "No description available"
    }

    /// Rewrites `unit` in place and returns `true` if anything changed.
    ///
    /// Every method whose code changed must be added to `cx.modified_methods`.
    ///
    /// # Errors
    /// Returns an error if the unit cannot be rewritten consistently.
    fn rewrite(&self, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> Result<bool>;

    /// Forgets rules about members of `owner` defined by `loader`.
    fn clear_rewrites(&self, _owner: &str, _loader: LoaderId) {}

    /// Forgets every rule defined by `loader`, once the host has discarded it.
    fn clear_loader(&self, _loader: LoaderId) {}
}

/// A change to apply at one instruction.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Replace the instruction with `nop`s and run the patch in its place
    Substitute(Patch),
    /// Keep the instruction and run the patch right after it
    InsertAfter(Patch),
}

/// Runs `plan` over every instruction of every method body and applies the returned edits.
///
/// `plan` receives the method index, the instruction and the symbol table. Methods with at
/// least one edit are re-encoded and recorded in `cx.modified_methods`.
///
/// # Errors
/// Returns the first error raised by `plan`, by decoding or by re-encoding.
pub fn edit_methods<F>(unit: &mut CompiledUnit, cx: &mut RewriteContext, mut plan: F) -> Result<bool>
where
    F: FnMut(usize, &Instruction, &mut SymbolTable) -> Result<Option<Edit>>,
{
    let CompiledUnit {
        symbols, methods, ..
    } = unit;

    let mut changed = false;
    for (index, method) in methods.iter_mut().enumerate() {
        let method_name = method.display_name(symbols);
        let Some(code) = method.code_mut() else {
            continue;
        };

        let mut stream: Option<InstructionStream> = None;
        for instruction in decode_all(&code.code)? {
            let Some(edit) = plan(index, &instruction, symbols)? else {
                continue;
            };
            if stream.is_none() {
                stream = Some(InstructionStream::decode(code, symbols)?);
            }
            let Some(active) = stream.as_mut() else {
                continue;
            };
            match edit {
                Edit::Substitute(patch) => active.substitute(instruction.offset, &patch)?,
                Edit::InsertAfter(patch) => active.insert_after(instruction.offset, &patch)?,
            }
        }

        if let Some(stream) = stream {
            *code = stream.encode(&method_name)?;
            cx.modified_methods.insert(index);
            changed = true;
        }
    }
    Ok(changed)
}

/// Fails with [`Error::RewriteFault`] unless `patch` has the stack effect `expected`.
///
/// # Errors
/// Returns [`Error::RewriteFault`] naming `rewriter` on a mismatch.
pub fn check_neutral(rewriter: &'static str, patch: &Patch, expected: i32) -> Result<()> {
    if patch.stack_delta == expected {
        return Ok(());
    }
    Err(Error::RewriteFault {
        rewriter,
        message: format!(
            "patch changes the stack by {} where the replaced instruction changes it by {}",
            patch.stack_delta, expected
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{encoder::PatchEncoder, opcodes::*},
        classfile::{builder::UnitBuilder, MemberAccess},
    };

    #[test]
    fn edits_only_matching_methods() -> Result<()> {
        let bytes = UnitBuilder::new("t/Edit")
            .method(MemberAccess::STATIC, "a", "()I", |code| {
                code.op(ICONST_1)?;
                code.op(IRETURN)
            })
            .method(MemberAccess::STATIC, "b", "()I", |code| {
                code.op(ICONST_2)?;
                code.op(IRETURN)
            })
            .build()?;
        let mut unit = CompiledUnit::parse(&bytes)?;
        let mut cx = RewriteContext::new(LoaderId(0), false, false);

        let changed = edit_methods(&mut unit, &mut cx, |_, instruction, symbols| {
            if instruction.opcode != ICONST_2 {
                return Ok(None);
            }
            let mut encoder = PatchEncoder::new(symbols);
            encoder.push_int(40)?;
            encoder.op(ICONST_2)?;
            encoder.op(IADD)?;
            encoder.op(SWAP)?;
            encoder.op(POP)?;
            Ok(Some(Edit::InsertAfter(encoder.finish()?)))
        })?;

        assert!(changed);
        assert_eq!(cx.modified_methods, ModifiedMethods::from([1]));
        assert_eq!(unit.methods[0].code().unwrap().code, vec![ICONST_1, IRETURN]);
        assert_eq!(
            unit.methods[1].code().unwrap().code,
            vec![ICONST_2, BIPUSH, 40, ICONST_2, IADD, SWAP, POP, IRETURN]
        );
        Ok(())
    }

    #[test]
    fn neutrality_mismatch_is_a_fault() {
        let patch = Patch {
            code: vec![ICONST_0],
            stack_delta: 1,
            max_depth: 1,
            min_depth: 0,
        };
        assert!(check_neutral("test", &patch, 1).is_ok());
        assert!(matches!(
            check_neutral("test", &patch, 0),
            Err(Error::RewriteFault { rewriter: "test", .. })
        ));
    }
}
