//! Bytecode emission for patches and synthesized method bodies.
//!
//! # Architecture
//!
//! [`PatchEncoder`] writes instructions into a self-contained buffer. Branches reference named
//! labels and are resolved when the encoder is finished; the resulting code uses ordinary
//! 16-bit relative displacements, so it can be decoded again by
//! [`crate::assembly::instruction::decode_all`] and spliced into a method by
//! [`crate::assembly::stream::InstructionStream::substitute`].
//!
//! Symbols needed by emitted instructions (method references, class constants, literals) are
//! appended to the unit's [`SymbolTable`] as they are emitted. The table is append-only, so
//! indices captured before the patch stay valid.
//!
//! The encoder tracks the operand-stack depth relative to the point where the patch starts.
//! A patch may consume operands that were pushed before it, so the depth may go below zero;
//! the lowest and highest depths reached are reported alongside the final delta. Every path
//! reaching a label must agree on the depth, which makes the finished delta the stack effect
//! of the patch on both the taken and the not-taken path of each branch.
//!
//! # Examples
//!
//! ```rust
//! use hotswap::assembly::{encoder::PatchEncoder, opcodes::*};
//! use hotswap::classfile::constants::SymbolTable;
//!
//! let mut symbols = SymbolTable::new();
//! let mut encoder = PatchEncoder::new(&mut symbols);
//!
//! // consumes the int already on the stack
//! encoder.branch(IFEQ, "zero")?;
//! encoder.push_int(1)?;
//! encoder.branch(GOTO, "end")?;
//! encoder.define_label("zero")?;
//! encoder.push_int(0)?;
//! encoder.define_label("end")?;
//!
//! let patch = encoder.finish()?;
//! assert_eq!(patch.stack_delta, 0);
//! assert_eq!(patch.min_depth, -1);
//! # Ok::<(), hotswap::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::opcodes::*,
    classfile::{
        constants::SymbolTable,
        descriptor::{FieldType, MethodDescriptor},
    },
    file::io::ByteSink,
    Result,
};

/// Label fixup information for branch instruction resolution.
#[derive(Debug, Clone)]
struct LabelFixup {
    /// The target label name to resolve
    label: String,
    /// Position in the buffer where the displacement is written
    fixup_position: usize,
    /// Position of the branch opcode, the base of the displacement
    instruction_position: usize,
}

/// A finished patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Encoded instructions with resolved branches
    pub code: Vec<u8>,
    /// Net change of the operand-stack depth, in slots
    pub stack_delta: i32,
    /// Highest depth reached relative to the start of the patch
    pub max_depth: i32,
    /// Lowest depth reached relative to the start of the patch
    pub min_depth: i32,
}

/// Emits instructions into a relocatable buffer while tracking stack depth.
pub struct PatchEncoder<'s> {
    symbols: &'s mut SymbolTable,
    code: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<LabelFixup>,
    depth: i32,
    max_depth: i32,
    min_depth: i32,
    label_depths: HashMap<String, i32>,
    unreachable: bool,
}

/// Stack effect `(pops, pushes)` in slots of an instruction without operands.
fn simple_effect(opcode: u8) -> Option<(i32, i32)> {
    Some(match opcode {
        NOP => (0, 0),
        ACONST_NULL..=ICONST_5 | FCONST_0..=FCONST_2 => (0, 1),
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 => (0, 2),
        ILOAD_0..=ILOAD_3 | FLOAD_0..=FLOAD_3 | ALOAD_0..=ALOAD_3 => (0, 1),
        LLOAD_0..=LLOAD_3 | DLOAD_0..=DLOAD_3 => (0, 2),
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => (2, 1),
        LALOAD | DALOAD => (2, 2),
        ISTORE_0..=ISTORE_3 | FSTORE_0..=FSTORE_3 | ASTORE_0..=ASTORE_3 => (1, 0),
        LSTORE_0..=LSTORE_3 | DSTORE_0..=DSTORE_3 => (2, 0),
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => (3, 0),
        LASTORE | DASTORE => (4, 0),
        POP => (1, 0),
        POP2 => (2, 0),
        DUP => (1, 2),
        DUP_X1 => (2, 3),
        DUP_X2 => (3, 4),
        DUP2 => (2, 4),
        DUP2_X1 => (3, 5),
        DUP2_X2 => (4, 6),
        SWAP => (2, 2),
        IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => (2, 1),
        FADD | FSUB | FMUL | FDIV | FREM => (2, 1),
        LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => (4, 2),
        DADD | DSUB | DMUL | DDIV | DREM => (4, 2),
        LSHL | LSHR | LUSHR => (3, 2),
        INEG | FNEG => (1, 1),
        LNEG | DNEG => (2, 2),
        I2F | F2I | I2B | I2C | I2S => (1, 1),
        I2L | I2D | F2L | F2D => (1, 2),
        L2I | L2F | D2I | D2F => (2, 1),
        L2D | D2L => (2, 2),
        LCMP | DCMPL | DCMPG => (4, 1),
        FCMPL | FCMPG => (2, 1),
        IRETURN | FRETURN | ARETURN => (1, 0),
        LRETURN | DRETURN => (2, 0),
        RETURN => (0, 0),
        ARRAYLENGTH => (1, 1),
        ATHROW | MONITORENTER | MONITOREXIT => (1, 0),
        _ => return None,
    })
}

impl<'s> PatchEncoder<'s> {
    /// Creates an encoder that appends any needed symbols to `symbols`.
    pub fn new(symbols: &'s mut SymbolTable) -> Self {
        PatchEncoder {
            symbols,
            code: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            depth: 0,
            max_depth: 0,
            min_depth: 0,
            label_depths: HashMap::new(),
            unreachable: false,
        }
    }

    /// The symbol table the encoder appends to.
    pub fn symbols(&mut self) -> &mut SymbolTable {
        self.symbols
    }

    /// Current depth relative to the start of the patch.
    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.depth
    }

    /// Overrides the current depth, e.g. to 1 at the start of an exception handler.
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }

    /// Offset of a bound label.
    #[must_use]
    pub fn label_offset(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Emits an instruction that has no operands.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` takes operands.
    pub fn op(&mut self, opcode: u8) -> Result<()> {
        let Some((pops, pushes)) = simple_effect(opcode) else {
            return Err(malformed_error!(
                "Opcode 0x{:02X} needs operands",
                opcode
            ));
        };
        self.code.put_be(opcode);
        self.apply(pops, pushes);
        if ends_block(opcode) {
            self.unreachable = true;
        }
        Ok(())
    }

    /// Emits a 16-bit branch to `label`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `opcode` is not `goto` or a conditional branch,
    /// or if the depth at the branch disagrees with an earlier path to `label`.
    pub fn branch(&mut self, opcode: u8, label: &str) -> Result<()> {
        let pops = match opcode {
            GOTO => 0,
            IFEQ..=IFLE | IFNULL | IFNONNULL => 1,
            IF_ICMPEQ..=IF_ACMPNE => 2,
            other => {
                return Err(malformed_error!(
                    "Opcode 0x{:02X} is not a 16-bit branch",
                    other
                ))
            }
        };

        let instruction_position = self.code.len();
        self.code.put_be(opcode);
        self.fixups.push(LabelFixup {
            label: label.to_string(),
            fixup_position: self.code.len(),
            instruction_position,
        });
        self.code.put_be(0_i16);

        self.apply(pops, 0);
        self.record_label_depth(label)?;
        if opcode == GOTO {
            self.unreachable = true;
        }
        Ok(())
    }

    /// Binds `name` to the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the label is already bound or if the
    /// fall-through depth disagrees with the depth recorded by branches to it.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }

        if let Some(&expected) = self.label_depths.get(name) {
            if self.unreachable {
                self.depth = expected;
            } else if self.depth != expected {
                return Err(malformed_error!(
                    "Stack depth mismatch at label '{}': expected {} (from branch), got {}",
                    name,
                    expected,
                    self.depth
                ));
            }
        } else if !self.unreachable {
            self.label_depths.insert(name.to_string(), self.depth);
        } else {
            self.depth = 0;
        }

        self.unreachable = false;
        let position = u32::try_from(self.code.len()).map_err(|_| out_of_bounds_error!())?;
        self.labels.insert(name.to_string(), position);
        Ok(())
    }

    /// Pushes an `int` constant using the shortest encoding.
    ///
    /// # Errors
    /// Returns [`crate::Error::SymbolTableFull`] if a literal symbol cannot be added.
    pub fn push_int(&mut self, value: i32) -> Result<()> {
        match value {
            -1..=5 => {
                // ICONST_0 is ICONST_M1 + 1
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let opcode = (i32::from(ICONST_0) + value) as u8;
                return self.op(opcode);
            }
            -128..=127 => {
                self.code.put_be(BIPUSH);
                #[allow(clippy::cast_possible_truncation)]
                self.code.put_be(value as i8);
            }
            -32768..=32767 => {
                self.code.put_be(SIPUSH);
                #[allow(clippy::cast_possible_truncation)]
                self.code.put_be(value as i16);
            }
            _ => {
                let index = self.symbols.add_integer(value)?;
                return self.ldc(index);
            }
        }
        self.apply(0, 1);
        Ok(())
    }

    /// Pushes a string literal.
    ///
    /// # Errors
    /// Returns [`crate::Error::SymbolTableFull`] if the literal cannot be added.
    pub fn push_string(&mut self, text: &str) -> Result<()> {
        let index = self.symbols.add_string(text)?;
        self.ldc(index)
    }

    /// Pushes the class object of `internal_name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::SymbolTableFull`] if the class symbol cannot be added.
    pub fn push_class(&mut self, internal_name: &str) -> Result<()> {
        let index = self.symbols.add_class(internal_name)?;
        self.ldc(index)
    }

    /// Pushes the single-slot constant at `index` with `ldc` or `ldc_w`.
    ///
    /// # Errors
    /// Never fails for valid indices; the signature matches the other emitters.
    pub fn ldc(&mut self, index: u16) -> Result<()> {
        if let Ok(short) = u8::try_from(index) {
            self.code.put_be(LDC);
            self.code.put_be(short);
        } else {
            self.code.put_be(LDC_W);
            self.code.put_be(index);
        }
        self.apply(0, 1);
        Ok(())
    }

    /// Emits a method invocation, adding the reference to the symbol table.
    ///
    /// `invokeinterface` gets an `InterfaceMethodref`; every other opcode a `Methodref`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad descriptor or non-invoke opcode and
    /// [`crate::Error::SymbolTableFull`] if the reference cannot be added.
    pub fn invoke(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Result<()> {
        let index = if opcode == INVOKEINTERFACE {
            self.symbols.add_interface_method_ref(owner, name, descriptor)?
        } else {
            self.symbols.add_method_ref(owner, name, descriptor)?
        };
        self.invoke_symbol(opcode, index)
    }

    /// Emits a method invocation through an existing method reference.
    ///
    /// The `invokeinterface` count byte is derived from the descriptor.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `index` is not a method reference or `opcode`
    /// is not an invoke.
    pub fn invoke_symbol(&mut self, opcode: u8, index: u16) -> Result<()> {
        let Some(member) = self.symbols.member_ref(index)? else {
            return Err(malformed_error!("Symbol {} is not a method reference", index));
        };
        let method = MethodDescriptor::parse(&member.descriptor)?;
        let receiver = match opcode {
            INVOKESTATIC => 0,
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKEINTERFACE => 1,
            other => return Err(malformed_error!("Opcode 0x{:02X} is not an invoke", other)),
        };
        let pops = i32::from(method.argument_slots()) + receiver;

        self.code.put_be(opcode);
        self.code.put_be(index);
        if opcode == INVOKEINTERFACE {
            let count = u8::try_from(pops)
                .map_err(|_| malformed_error!("Too many arguments for invokeinterface"))?;
            self.code.put_be(count);
            self.code.put_be(0_u8);
        }
        self.apply(pops, i32::from(method.return_slots()));
        Ok(())
    }

    /// Emits a field access, adding the reference to the symbol table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a bad descriptor or non-field opcode and
    /// [`crate::Error::SymbolTableFull`] if the reference cannot be added.
    pub fn field(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Result<()> {
        let index = self.symbols.add_field_ref(owner, name, descriptor)?;
        self.field_symbol(opcode, index)
    }

    /// Emits a field access through an existing field reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `index` is not a field reference or `opcode`
    /// is not a field access.
    pub fn field_symbol(&mut self, opcode: u8, index: u16) -> Result<()> {
        let Some(member) = self.symbols.member_ref(index)? else {
            return Err(malformed_error!("Symbol {} is not a field reference", index));
        };
        let slots = i32::from(FieldType::parse(&member.descriptor)?.slots());
        let (pops, pushes) = match opcode {
            GETSTATIC => (0, slots),
            PUTSTATIC => (slots, 0),
            GETFIELD => (1, slots),
            PUTFIELD => (1 + slots, 0),
            other => {
                return Err(malformed_error!(
                    "Opcode 0x{:02X} is not a field access",
                    other
                ))
            }
        };

        self.code.put_be(opcode);
        self.code.put_be(index);
        self.apply(pops, pushes);
        Ok(())
    }

    /// Emits `new`, `checkcast`, `instanceof` or `anewarray` for `class_name`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for any other opcode and
    /// [`crate::Error::SymbolTableFull`] if the class symbol cannot be added.
    pub fn type_op(&mut self, opcode: u8, class_name: &str) -> Result<()> {
        let (pops, pushes) = match opcode {
            NEW => (0, 1),
            CHECKCAST | INSTANCEOF | ANEWARRAY => (1, 1),
            other => {
                return Err(malformed_error!(
                    "Opcode 0x{:02X} does not take a class operand",
                    other
                ))
            }
        };
        let index = self.symbols.add_class(class_name)?;
        self.code.put_be(opcode);
        self.code.put_be(index);
        self.apply(pops, pushes);
        Ok(())
    }

    /// Emits a load or store with an explicit local index (`iload 4`, `astore 7`).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a non load/store opcode.
    pub fn local(&mut self, opcode: u8, index: u16) -> Result<()> {
        let (pops, pushes) = match opcode {
            ILOAD | FLOAD | ALOAD => (0, 1),
            LLOAD | DLOAD => (0, 2),
            ISTORE | FSTORE | ASTORE => (1, 0),
            LSTORE | DSTORE => (2, 0),
            other => {
                return Err(malformed_error!(
                    "Opcode 0x{:02X} is not a local load or store",
                    other
                ))
            }
        };
        if let Ok(short) = u8::try_from(index) {
            self.code.put_be(opcode);
            self.code.put_be(short);
        } else {
            self.code.put_be(WIDE);
            self.code.put_be(opcode);
            self.code.put_be(index);
        }
        self.apply(pops, pushes);
        Ok(())
    }

    /// Resolves all labels and returns the finished patch.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a label is undefined or a displacement does
    /// not fit in 16 bits.
    pub fn finish(mut self) -> Result<Patch> {
        for fixup in std::mem::take(&mut self.fixups) {
            let Some(&target) = self.labels.get(&fixup.label) else {
                return Err(malformed_error!("Undefined label '{}'", fixup.label));
            };
            let base = i64::try_from(fixup.instruction_position).map_err(|_| out_of_bounds_error!())?;
            let displacement = i16::try_from(i64::from(target) - base).map_err(|_| {
                malformed_error!("Branch to '{}' exceeds 16 bits", fixup.label)
            })?;
            self.code[fixup.fixup_position..fixup.fixup_position + 2]
                .copy_from_slice(&displacement.to_be_bytes());
        }

        Ok(Patch {
            code: self.code,
            stack_delta: self.depth,
            max_depth: self.max_depth,
            min_depth: self.min_depth,
        })
    }

    fn apply(&mut self, pops: i32, pushes: i32) {
        if self.unreachable {
            return;
        }
        self.depth -= pops;
        self.min_depth = self.min_depth.min(self.depth);
        self.depth += pushes;
        self.max_depth = self.max_depth.max(self.depth);
    }

    fn record_label_depth(&mut self, label: &str) -> Result<()> {
        if self.unreachable {
            return Ok(());
        }

        if let Some(&expected) = self.label_depths.get(label) {
            if self.depth != expected {
                return Err(malformed_error!(
                    "Stack depth mismatch for branch to '{}': expected {}, but branch has {}",
                    label,
                    expected,
                    self.depth
                ));
            }
        } else {
            self.label_depths.insert(label.to_string(), self.depth);
        }
        Ok(())
    }
}
