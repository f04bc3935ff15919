//! Conversions between typed operands and the `Object` values runtime helpers traffic in.

use crate::{
    assembly::{encoder::PatchEncoder, opcodes::*},
    classfile::descriptor::FieldType,
    Result,
};

/// Boxes the value of type `field` on top of the stack; references are left untouched.
///
/// # Errors
/// Returns [`crate::Error::SymbolTableFull`] if the wrapper factory cannot be referenced.
pub fn box_value(encoder: &mut PatchEncoder<'_>, field: &FieldType) -> Result<()> {
    match field.boxing() {
        Some(info) => encoder.invoke(INVOKESTATIC, info.wrapper, "valueOf", info.value_of),
        None => Ok(()),
    }
}

/// Converts the `Object` on top of the stack back to a value of type `field`: primitives are
/// cast to their wrapper and unboxed, references are narrowed with `checkcast`.
///
/// # Errors
/// Returns [`crate::Error::SymbolTableFull`] if the symbols cannot be added.
pub fn unbox_value(encoder: &mut PatchEncoder<'_>, field: &FieldType) -> Result<()> {
    if let Some(info) = field.boxing() {
        encoder.type_op(CHECKCAST, info.wrapper)?;
        return encoder.invoke(
            INVOKEVIRTUAL,
            info.wrapper,
            info.unbox_name,
            info.unbox_descriptor,
        );
    }

    match field.class_name() {
        Some("java/lang/Object") | None => Ok(()),
        Some(name) => encoder.type_op(CHECKCAST, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::instruction::decode_all, classfile::constants::SymbolTable};

    fn emit(f: impl FnOnce(&mut PatchEncoder<'_>) -> Result<()>) -> (Vec<u8>, i32) {
        let mut symbols = SymbolTable::new();
        let mut encoder = PatchEncoder::new(&mut symbols);
        f(&mut encoder).unwrap();
        let patch = encoder.finish().unwrap();
        let opcodes = decode_all(&patch.code)
            .unwrap()
            .into_iter()
            .map(|i| i.opcode)
            .collect();
        (opcodes, patch.stack_delta)
    }

    #[test]
    fn boxing_wide_values_narrows_the_stack() {
        let (ops, delta) = emit(|e| box_value(e, &FieldType::Long));
        assert_eq!(ops, vec![INVOKESTATIC]);
        assert_eq!(delta, -1);

        let (ops, delta) = emit(|e| box_value(e, &FieldType::Object("a/B".into())));
        assert!(ops.is_empty());
        assert_eq!(delta, 0);
    }

    #[test]
    fn unboxing_casts_first() {
        let (ops, delta) = emit(|e| unbox_value(e, &FieldType::Double));
        assert_eq!(ops, vec![CHECKCAST, INVOKEVIRTUAL]);
        assert_eq!(delta, 1);

        let (ops, _) = emit(|e| unbox_value(e, &FieldType::Array("[I".into())));
        assert_eq!(ops, vec![CHECKCAST]);

        let (ops, _) = emit(|e| unbox_value(e, &FieldType::Object("java/lang/Object".into())));
        assert!(ops.is_empty());
    }
}
