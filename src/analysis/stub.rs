//! Replacement bodies for methods whose repair hit an unresolvable type.
//!
//! Load failures must not surface while a unit is being defined. Instead the method is
//! swapped for a body that raises `java.lang.NoClassDefFoundError` with the original
//! diagnostic when it is first called.

use crate::{
    analysis::{repair_method, LenientHierarchy},
    assembly::{encoder::PatchEncoder, opcodes::*},
    classfile::{
        code::CodeAttribute, constants::modified_utf8_width, descriptor::MethodDescriptor,
        Attribute, CompiledUnit,
    },
    Result,
};

const ERROR_CLASS: &str = "java/lang/NoClassDefFoundError";

/// Longest diagnostic kept in a stub, in modified UTF-8 bytes.
const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Replaces the body of method `index` with one that throws `NoClassDefFoundError(message)`.
///
/// The new body has no exception handlers and no nested attributes; its local slots are the
/// argument slots plus one. Frames are rebuilt afterwards, which cannot fail for this body.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for an invalid method index and
/// [`crate::Error::SymbolTableFull`] if the constants cannot be added.
pub fn failure_stub(unit: &mut CompiledUnit, index: usize, message: &str) -> Result<()> {
    let descriptor = unit
        .methods
        .get(index)
        .ok_or(out_of_bounds_error!())?
        .descriptor(&unit.symbols)?
        .into_owned();
    let max_locals = MethodDescriptor::parse(&descriptor)?.argument_slots() + 1;

    let message = truncate_encoded(message, MAX_MESSAGE_BYTES);
    let mut encoder = PatchEncoder::new(&mut unit.symbols);
    encoder.type_op(NEW, ERROR_CLASS)?;
    encoder.op(DUP)?;
    encoder.push_string(&message)?;
    encoder.invoke(INVOKESPECIAL, ERROR_CLASS, "<init>", "(Ljava/lang/String;)V")?;
    encoder.op(ATHROW)?;
    let patch = encoder.finish()?;

    let body = CodeAttribute {
        max_stack: 0,
        max_locals,
        code: patch.code,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    let code_name = unit.symbols.add_utf8("Code")?;
    let method = &mut unit.methods[index];
    match method.code_mut() {
        Some(existing) => *existing = body,
        None => method.attributes.push(Attribute::Code {
            name_index: code_name,
            code: body,
        }),
    }

    repair_method(unit, index, &LenientHierarchy)
}

/// Longest prefix of `text` whose modified UTF-8 encoding fits in `limit` bytes.
fn truncate_encoded(text: &str, limit: usize) -> &str {
    let mut used = 0;
    for (offset, ch) in text.char_indices() {
        used += modified_utf8_width(ch);
        if used > limit {
            return &text[..offset];
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::instruction::decode_all,
        classfile::{builder::UnitBuilder, MemberAccess},
    };

    #[test]
    fn stub_throws_with_message() -> Result<()> {
        let bytes = UnitBuilder::new("t/Broken")
            .method(MemberAccess::PUBLIC, "compute", "(JI)I", |code| {
                code.define_label("start")?;
                code.op(ILOAD_3)?;
                code.op(IRETURN)?;
                code.define_label("handler")?;
                code.set_stack_depth(1);
                code.op(ATHROW)
            })
            .catch("start", "handler", "handler", None)
            .build()?;
        let mut unit = CompiledUnit::parse(&bytes)?;

        failure_stub(&mut unit, 0, "a/Missing")?;

        let code = unit.methods[0].code().unwrap();
        assert!(code.exception_table.is_empty());
        assert!(code.attributes.is_empty());
        assert_eq!(code.max_locals, 4);
        assert_eq!(code.max_stack, 3);

        let instructions = decode_all(&code.code)?;
        let opcodes: Vec<u8> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![NEW, DUP, LDC, INVOKESPECIAL, ATHROW]);
        let constant = instructions[2].symbol().unwrap();
        let text = unit.symbols.add_utf8("a/Missing")?;
        assert_eq!(
            unit.symbols.get(constant),
            Some(&crate::classfile::constants::Symbol::String { value: text })
        );

        // the stub survives a round trip through bytes
        let reparsed = CompiledUnit::parse(&unit.to_bytes()?)?;
        assert_eq!(reparsed.methods[0], unit.methods[0]);
        Ok(())
    }

    #[test]
    fn long_messages_are_cut_by_encoded_length() -> Result<()> {
        let bytes = UnitBuilder::new("t/Broken")
            .method(MemberAccess::STATIC, "run", "()V", |code| code.op(RETURN))
            .build()?;
        let mut unit = CompiledUnit::parse(&bytes)?;

        failure_stub(&mut unit, 0, &"😀".repeat(16_000))?;

        let reparsed = CompiledUnit::parse(&unit.to_bytes()?)?;
        assert_eq!(reparsed.methods[0], unit.methods[0]);
        Ok(())
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        assert_eq!(truncate_encoded("abc", 8), "abc");
        assert_eq!(truncate_encoded("a\0b", 3), "a\0");
        // each astral character takes six bytes
        assert_eq!(truncate_encoded("😀😀", 11), "😀");
        assert_eq!(truncate_encoded("😀", 5), "");
    }
}
