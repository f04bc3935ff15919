//! Redirected reflective access.
//!
//! Reflection bypasses the field storage redirect: `Field.getInt(obj)` on a field that was
//! added after load would find nothing. Calls to the accessors of `java/lang/reflect/Field`
//! and to `Constructor.newInstance` are therefore wrapped in a predicate dispatch. When the
//! runtime helper says the handle is not redirected, the original call runs unchanged.

use tracing::trace;

use crate::{
    assembly::{
        encoder::{Patch, PatchEncoder},
        instruction::Instruction,
        opcodes::*,
    },
    classfile::{
        constants::{MemberKind, MemberRef, SymbolTable},
        descriptor::{invoke_delta, MethodDescriptor},
        CompiledUnit,
    },
    rewrite::{
        check_neutral, edit_methods,
        scanner::{scan_references, ReferenceRule},
        targets::{RuntimeTargets, CONSTRUCTOR_INVOKE, CONSTRUCTOR_PREDICATE, FIELD_PREDICATE},
        Edit, RewriteContext, Rewriter,
    },
    Result,
};

const FIELD_CLASS: &str = "java/lang/reflect/Field";
const CONSTRUCTOR_CLASS: &str = "java/lang/reflect/Constructor";
const NEW_INSTANCE: (&str, &str) = ("newInstance", "([Ljava/lang/Object;)Ljava/lang/Object;");

/// One accessor of `java/lang/reflect/Field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAccessor {
    /// Method name on `Field` and on the helper
    pub name: &'static str,
    /// Descriptor on `Field`
    pub descriptor: &'static str,
    /// `true` for setters
    pub set: bool,
    /// `true` if the value is a `long` or `double`
    pub wide: bool,
}

const fn accessor(name: &'static str, descriptor: &'static str, set: bool, wide: bool) -> FieldAccessor {
    FieldAccessor {
        name,
        descriptor,
        set,
        wide,
    }
}

/// The nine setters and nine getters that are intercepted.
pub const FIELD_ACCESSORS: [FieldAccessor; 18] = [
    accessor("set", "(Ljava/lang/Object;Ljava/lang/Object;)V", true, false),
    accessor("setBoolean", "(Ljava/lang/Object;Z)V", true, false),
    accessor("setByte", "(Ljava/lang/Object;B)V", true, false),
    accessor("setChar", "(Ljava/lang/Object;C)V", true, false),
    accessor("setDouble", "(Ljava/lang/Object;D)V", true, true),
    accessor("setFloat", "(Ljava/lang/Object;F)V", true, false),
    accessor("setInt", "(Ljava/lang/Object;I)V", true, false),
    accessor("setLong", "(Ljava/lang/Object;J)V", true, true),
    accessor("setShort", "(Ljava/lang/Object;S)V", true, false),
    accessor("get", "(Ljava/lang/Object;)Ljava/lang/Object;", false, false),
    accessor("getBoolean", "(Ljava/lang/Object;)Z", false, false),
    accessor("getByte", "(Ljava/lang/Object;)B", false, false),
    accessor("getChar", "(Ljava/lang/Object;)C", false, false),
    accessor("getDouble", "(Ljava/lang/Object;)D", false, true),
    accessor("getFloat", "(Ljava/lang/Object;)F", false, false),
    accessor("getInt", "(Ljava/lang/Object;)I", false, false),
    accessor("getLong", "(Ljava/lang/Object;)J", false, true),
    accessor("getShort", "(Ljava/lang/Object;)S", false, false),
];

impl FieldAccessor {
    fn find(name: &str, descriptor: &str) -> Option<&'static FieldAccessor> {
        FIELD_ACCESSORS
            .iter()
            .find(|accessor| accessor.name == name && accessor.descriptor == descriptor)
    }

    /// Descriptor of the helper method: the `Field` becomes the first argument.
    #[must_use]
    pub fn helper_descriptor(&self) -> String {
        format!("(L{FIELD_CLASS};{}", &self.descriptor[1..])
    }

    /// Stack shuffle that copies the `Field` handle to the top, above the call's operands.
    fn copy_handle(&self, encoder: &mut PatchEncoder<'_>) -> Result<()> {
        let shuffle: &[u8] = match (self.set, self.wide) {
            // Field, target, value(2) -> Field, target, value(2), Field
            (true, true) => &[DUP2_X2, POP2, DUP2_X2, POP],
            // Field, target, value -> Field, target, value, Field
            (true, false) => &[DUP_X2, POP, DUP_X2, POP, DUP_X2],
            // Field, target -> Field, target, Field
            (false, _) => &[DUP_X1, POP, DUP_X1],
        };
        for opcode in shuffle {
            encoder.op(*opcode)?;
        }
        Ok(())
    }
}

fn is_virtual_call(instruction: &Instruction) -> bool {
    matches!(instruction.opcode, INVOKEVIRTUAL | INVOKEINTERFACE)
}

/// Wraps `Field` getters and setters in a redirect check.
pub struct ReflectiveFieldRewriter {
    targets: RuntimeTargets,
}

impl ReflectiveFieldRewriter {
    /// Creates a rewriter calling the helper named in `targets`.
    #[must_use]
    pub fn new(targets: RuntimeTargets) -> Self {
        ReflectiveFieldRewriter { targets }
    }

    fn redirect_patch(
        &self,
        instruction: &Instruction,
        index: u16,
        accessor: &FieldAccessor,
        symbols: &mut SymbolTable,
    ) -> Result<Patch> {
        let helper = self.targets.field_reflection.as_str();
        let mut encoder = PatchEncoder::new(symbols);
        accessor.copy_handle(&mut encoder)?;
        encoder.invoke(INVOKESTATIC, helper, FIELD_PREDICATE.0, FIELD_PREDICATE.1)?;
        encoder.branch(IFEQ, "original")?;
        encoder.invoke(
            INVOKESTATIC,
            helper,
            accessor.name,
            &accessor.helper_descriptor(),
        )?;
        encoder.branch(GOTO, "end")?;
        encoder.define_label("original")?;
        encoder.invoke_symbol(instruction.opcode, index)?;
        encoder.define_label("end")?;

        let patch = encoder.finish()?;
        let expected = invoke_delta(&MethodDescriptor::parse(accessor.descriptor)?, true);
        check_neutral(FIELD_NAME, &patch, expected)?;
        Ok(patch)
    }
}

const FIELD_NAME: &str = "reflective-field";
const CONSTRUCTOR_NAME: &str = "reflective-constructor";

struct AccessorScan;

impl ReferenceRule for AccessorScan {
    type Redirect = &'static FieldAccessor;

    fn classify(
        &mut self,
        _index: u16,
        reference: &MemberRef<'_>,
        _symbols: &mut SymbolTable,
        _cx: &mut RewriteContext,
    ) -> Result<Option<&'static FieldAccessor>> {
        if reference.kind == MemberKind::Field || reference.owner != FIELD_CLASS {
            return Ok(None);
        }
        Ok(FieldAccessor::find(&reference.name, &reference.descriptor))
    }
}

impl Rewriter for ReflectiveFieldRewriter {
    fn name(&self) -> &'static str {
        FIELD_NAME
    }

    fn description(&self) -> &'static str {
        "Routes reflective field access through the runtime when the field is redirected"
    }

    fn rewrite(&self, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> Result<bool> {
        let matches = scan_references(unit, &mut AccessorScan, cx)?;
        if matches.is_empty() {
            return Ok(false);
        }
        trace!(references = matches.len(), "reflective field accessors referenced");

        edit_methods(unit, cx, |_, instruction, symbols| {
            if !is_virtual_call(instruction) {
                return Ok(None);
            }
            let Some(index) = instruction.symbol() else {
                return Ok(None);
            };
            let Some(accessor) = matches.get(index) else {
                return Ok(None);
            };
            self.redirect_patch(instruction, index, accessor, symbols)
                .map(|patch| Some(Edit::Substitute(patch)))
        })
    }
}

/// Wraps `Constructor.newInstance` in a redirect check.
pub struct ReflectiveConstructorRewriter {
    targets: RuntimeTargets,
}

impl ReflectiveConstructorRewriter {
    /// Creates a rewriter calling the helper named in `targets`.
    #[must_use]
    pub fn new(targets: RuntimeTargets) -> Self {
        ReflectiveConstructorRewriter { targets }
    }

    fn redirect_patch(
        &self,
        instruction: &Instruction,
        index: u16,
        symbols: &mut SymbolTable,
    ) -> Result<Patch> {
        let helper = self.targets.constructor_reflection.as_str();
        let mut encoder = PatchEncoder::new(symbols);
        // Constructor, args -> Constructor, args, Constructor
        encoder.op(SWAP)?;
        encoder.op(DUP_X1)?;
        encoder.invoke(
            INVOKESTATIC,
            helper,
            CONSTRUCTOR_PREDICATE.0,
            CONSTRUCTOR_PREDICATE.1,
        )?;
        encoder.branch(IFEQ, "original")?;
        encoder.invoke(INVOKESTATIC, helper, CONSTRUCTOR_INVOKE.0, CONSTRUCTOR_INVOKE.1)?;
        encoder.branch(GOTO, "end")?;
        encoder.define_label("original")?;
        encoder.invoke_symbol(instruction.opcode, index)?;
        encoder.define_label("end")?;

        let patch = encoder.finish()?;
        let expected = invoke_delta(&MethodDescriptor::parse(NEW_INSTANCE.1)?, true);
        check_neutral(CONSTRUCTOR_NAME, &patch, expected)?;
        Ok(patch)
    }
}

struct NewInstanceScan;

impl ReferenceRule for NewInstanceScan {
    type Redirect = ();

    fn classify(
        &mut self,
        _index: u16,
        reference: &MemberRef<'_>,
        _symbols: &mut SymbolTable,
        _cx: &mut RewriteContext,
    ) -> Result<Option<()>> {
        let matched = reference.kind == MemberKind::Method
            && reference.owner == CONSTRUCTOR_CLASS
            && reference.name == NEW_INSTANCE.0
            && reference.descriptor == NEW_INSTANCE.1;
        Ok(matched.then_some(()))
    }
}

impl Rewriter for ReflectiveConstructorRewriter {
    fn name(&self) -> &'static str {
        CONSTRUCTOR_NAME
    }

    fn description(&self) -> &'static str {
        "Routes reflective constructor calls through the runtime when a fake call is required"
    }

    fn rewrite(&self, unit: &mut CompiledUnit, cx: &mut RewriteContext) -> Result<bool> {
        let matches = scan_references(unit, &mut NewInstanceScan, cx)?;
        if matches.is_empty() {
            return Ok(false);
        }

        edit_methods(unit, cx, |_, instruction, symbols| {
            if instruction.opcode != INVOKEVIRTUAL {
                return Ok(None);
            }
            match instruction.symbol() {
                Some(index) if matches.get(index).is_some() => self
                    .redirect_patch(instruction, index, symbols)
                    .map(|patch| Some(Edit::Substitute(patch))),
                _ => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::instruction::decode_all,
        classfile::{builder::UnitBuilder, LoaderId, MemberAccess},
    };

    fn opcodes(unit: &CompiledUnit, method: usize) -> Vec<u8> {
        decode_all(&unit.methods[method].code().unwrap().code)
            .unwrap()
            .into_iter()
            .map(|i| i.opcode)
            .collect()
    }

    #[test]
    fn every_accessor_patch_is_stack_neutral() -> Result<()> {
        let rewriter = ReflectiveFieldRewriter::new(RuntimeTargets::default());
        for accessor in &FIELD_ACCESSORS {
            let mut symbols = SymbolTable::new();
            let index = symbols.add_method_ref(FIELD_CLASS, accessor.name, accessor.descriptor)?;
            let instruction = Instruction {
                offset: 0,
                opcode: INVOKEVIRTUAL,
                wide: false,
                length: 3,
                operands: crate::assembly::instruction::Operands::Symbol(index),
            };
            // check_neutral inside redirect_patch rejects any imbalance
            rewriter.redirect_patch(&instruction, index, accessor, &mut symbols)?;
        }
        Ok(())
    }

    #[test]
    fn wide_setter_helper_takes_the_field_first() {
        let set_long = FieldAccessor::find("setLong", "(Ljava/lang/Object;J)V").unwrap();
        assert!(set_long.wide);
        assert_eq!(
            set_long.helper_descriptor(),
            "(Ljava/lang/reflect/Field;Ljava/lang/Object;J)V"
        );
        assert!(FieldAccessor::find("setLong", "(Ljava/lang/Object;I)V").is_none());
    }

    #[test]
    fn wraps_field_getters() -> Result<()> {
        let bytes = UnitBuilder::new("t/Reflect")
            .method(
                MemberAccess::STATIC,
                "read",
                "(Ljava/lang/reflect/Field;Ljava/lang/Object;)I",
                |code| {
                    code.op(ALOAD_0)?;
                    code.op(ALOAD_1)?;
                    code.invoke(INVOKEVIRTUAL, FIELD_CLASS, "getInt", "(Ljava/lang/Object;)I")?;
                    code.op(IRETURN)
                },
            )
            .method(MemberAccess::STATIC, "name", "(Ljava/lang/reflect/Field;)Ljava/lang/String;", |code| {
                code.op(ALOAD_0)?;
                code.invoke(INVOKEVIRTUAL, FIELD_CLASS, "getName", "()Ljava/lang/String;")?;
                code.op(ARETURN)
            })
            .build()?;
        let mut unit = CompiledUnit::parse(&bytes)?;
        let mut cx = RewriteContext::new(LoaderId(0), false, false);

        assert!(ReflectiveFieldRewriter::new(RuntimeTargets::default()).rewrite(&mut unit, &mut cx)?);
        assert_eq!(cx.modified_methods.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(
            opcodes(&unit, 0),
            vec![
                ALOAD_0,
                ALOAD_1,
                NOP,
                NOP,
                NOP,
                DUP_X1,
                POP,
                DUP_X1,
                INVOKESTATIC,
                IFEQ,
                INVOKESTATIC,
                GOTO,
                INVOKEVIRTUAL,
                IRETURN
            ]
        );
        Ok(())
    }

    #[test]
    fn wraps_constructor_new_instance() -> Result<()> {
        let bytes = UnitBuilder::new("t/Make")
            .method(
                MemberAccess::STATIC,
                "make",
                "(Ljava/lang/reflect/Constructor;)Ljava/lang/Object;",
                |code| {
                    code.op(ALOAD_0)?;
                    code.op(ACONST_NULL)?;
                    code.invoke(INVOKEVIRTUAL, CONSTRUCTOR_CLASS, NEW_INSTANCE.0, NEW_INSTANCE.1)?;
                    code.op(ARETURN)
                },
            )
            .build()?;
        let mut unit = CompiledUnit::parse(&bytes)?;
        let original_index = decode_all(&unit.methods[0].code().unwrap().code)?[2]
            .symbol()
            .unwrap();
        let mut cx = RewriteContext::new(LoaderId(0), false, false);

        assert!(ReflectiveConstructorRewriter::new(RuntimeTargets::default())
            .rewrite(&mut unit, &mut cx)?);

        let instructions = decode_all(&unit.methods[0].code().unwrap().code)?;
        let original = instructions
            .iter()
            .find(|i| i.opcode == INVOKEVIRTUAL)
            .unwrap();
        // the not-redirected path re-issues the very same call
        assert_eq!(original.symbol(), Some(original_index));
        assert_eq!(instructions.iter().filter(|i| i.opcode == INVOKESTATIC).count(), 2);
        Ok(())
    }
}
