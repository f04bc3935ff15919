//! JVM instruction representation, decoding and encoding.
//!
//! # Architecture
//!
//! Operands are generic over the type used for branch targets. The decoder produces
//! [`Operands<u32>`] holding absolute code offsets; [`crate::assembly::stream`] maps those to
//! labels so instructions can be moved, and the encoder writes them back with relative
//! displacements once a layout is fixed.
//!
//! # Key Components
//!
//! - [`crate::assembly::instruction::Instruction`] - One decoded instruction with its offset
//! - [`crate::assembly::instruction::Operands`] - Type-safe operand representation
//! - [`crate::assembly::instruction::decode_all`] - Decode a complete code array
//! - [`crate::assembly::instruction::encode`] - Write one instruction at a given offset

use crate::{
    assembly::opcodes::*,
    file::{io::ByteSink, parser::Parser},
    Result,
};

/// Operands of a JVM instruction, generic over the branch-target representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operands<T> {
    /// No operand bytes
    None,
    /// `bipush` immediate
    Byte(i8),
    /// `sipush` immediate
    Short(i16),
    /// Local-variable index of a load, store or `ret`
    Local(u16),
    /// `iinc` operands
    Iinc {
        /// Local-variable index
        local: u16,
        /// Signed increment
        delta: i16,
    },
    /// Symbol index of `ldc*`, field access, `invoke{virtual,special,static}`, `new`,
    /// `anewarray`, `checkcast` and `instanceof`
    Symbol(u16),
    /// `invokeinterface` operands
    InvokeInterface {
        /// Symbol index of the interface method
        index: u16,
        /// Argument slot count including the receiver
        count: u8,
    },
    /// `invokedynamic` call-site symbol index
    InvokeDynamic(u16),
    /// `multianewarray` operands
    MultiANewArray {
        /// Symbol index of the array class
        index: u16,
        /// Number of dimensions to allocate
        dimensions: u8,
    },
    /// `newarray` primitive element code
    ArrayType(u8),
    /// Branch target of a jump
    Branch(T),
    /// `tableswitch` operands
    TableSwitch {
        /// Target when the key is out of range
        default: T,
        /// Lowest key
        low: i32,
        /// Targets for `low..=low + targets.len() - 1`
        targets: Vec<T>,
    },
    /// `lookupswitch` operands
    LookupSwitch {
        /// Target when no key matches
        default: T,
        /// Sorted `(key, target)` pairs
        pairs: Vec<(i32, T)>,
    },
}

impl<T> Operands<T> {
    /// Converts every branch target with `f`, keeping all other operands.
    pub fn map_targets<U>(self, mut f: impl FnMut(T) -> U) -> Operands<U> {
        match self {
            Operands::None => Operands::None,
            Operands::Byte(value) => Operands::Byte(value),
            Operands::Short(value) => Operands::Short(value),
            Operands::Local(local) => Operands::Local(local),
            Operands::Iinc { local, delta } => Operands::Iinc { local, delta },
            Operands::Symbol(index) => Operands::Symbol(index),
            Operands::InvokeInterface { index, count } => Operands::InvokeInterface { index, count },
            Operands::InvokeDynamic(index) => Operands::InvokeDynamic(index),
            Operands::MultiANewArray { index, dimensions } => {
                Operands::MultiANewArray { index, dimensions }
            }
            Operands::ArrayType(code) => Operands::ArrayType(code),
            Operands::Branch(target) => Operands::Branch(f(target)),
            Operands::TableSwitch {
                default,
                low,
                targets,
            } => Operands::TableSwitch {
                default: f(default),
                low,
                targets: targets.into_iter().map(&mut f).collect(),
            },
            Operands::LookupSwitch { default, pairs } => Operands::LookupSwitch {
                default: f(default),
                pairs: pairs.into_iter().map(|(key, target)| (key, f(target))).collect(),
            },
        }
    }

    /// Every branch target referenced by these operands.
    #[must_use]
    pub fn targets(&self) -> Vec<&T> {
        match self {
            Operands::Branch(target) => vec![target],
            Operands::TableSwitch {
                default, targets, ..
            } => std::iter::once(default).chain(targets.iter()).collect(),
            Operands::LookupSwitch { default, pairs } => std::iter::once(default)
                .chain(pairs.iter().map(|(_, target)| target))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The symbol-table index embedded in these operands, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<u16> {
        match self {
            Operands::Symbol(index)
            | Operands::InvokeInterface { index, .. }
            | Operands::InvokeDynamic(index)
            | Operands::MultiANewArray { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the opcode (or of the `wide` prefix) in the code array
    pub offset: u32,
    /// The opcode; for `wide` instructions this is the widened opcode
    pub opcode: u8,
    /// `true` if the instruction carries the `wide` prefix
    pub wide: bool,
    /// Encoded length in bytes, including any prefix and switch padding
    pub length: u32,
    /// Decoded operands with absolute branch targets
    pub operands: Operands<u32>,
}

impl Instruction {
    /// The symbol-table index embedded in the instruction, if any.
    #[must_use]
    pub fn symbol(&self) -> Option<u16> {
        self.operands.symbol()
    }

    /// Offset of the instruction that follows this one.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset + self.length
    }
}

fn branch_target(offset: usize, relative: i32) -> Result<u32> {
    let absolute = i64::try_from(offset).map_err(|_| out_of_bounds_error!())? + i64::from(relative);
    u32::try_from(absolute).map_err(|_| malformed_error!("Branch from {} to {}", offset, absolute))
}

/// Decodes the instruction at `offset` of `code`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for unknown opcodes or invalid `wide` forms and
/// [`crate::Error::OutOfBounds`] for truncated instructions.
pub fn decode(code: &[u8], offset: usize) -> Result<Instruction> {
    let mut parser = Parser::new(code);
    parser.seek(offset)?;
    let mut opcode = parser.read_be::<u8>()?;
    let mut wide = false;

    let operands = match opcode {
        WIDE => {
            wide = true;
            opcode = parser.read_be::<u8>()?;
            match opcode {
                ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Operands::Local(parser.read_be()?),
                IINC => Operands::Iinc {
                    local: parser.read_be()?,
                    delta: parser.read_be()?,
                },
                other => {
                    return Err(malformed_error!(
                        "Opcode 0x{:02X} cannot be widened at {}",
                        other,
                        offset
                    ))
                }
            }
        }
        NOP..=DCONST_1
        | ILOAD_0..=SALOAD
        | ISTORE_0..=LXOR
        | I2L..=DCMPG
        | IRETURN..=RETURN
        | ARRAYLENGTH
        | ATHROW
        | MONITORENTER
        | MONITOREXIT => Operands::None,
        BIPUSH => Operands::Byte(parser.read_be()?),
        SIPUSH => Operands::Short(parser.read_be()?),
        LDC => Operands::Symbol(u16::from(parser.read_be::<u8>()?)),
        LDC_W | LDC2_W | GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
            Operands::Symbol(parser.read_be()?)
        }
        ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
            Operands::Local(u16::from(parser.read_be::<u8>()?))
        }
        IINC => Operands::Iinc {
            local: u16::from(parser.read_be::<u8>()?),
            delta: i16::from(parser.read_be::<i8>()?),
        },
        IFEQ..=JSR | IFNULL | IFNONNULL => {
            Operands::Branch(branch_target(offset, i32::from(parser.read_be::<i16>()?))?)
        }
        GOTO_W | JSR_W => Operands::Branch(branch_target(offset, parser.read_be::<i32>()?)?),
        TABLESWITCH => {
            parser.align_from(0, 4)?;
            let default = branch_target(offset, parser.read_be()?)?;
            let low = parser.read_be::<i32>()?;
            let high = parser.read_be::<i32>()?;
            if high < low {
                return Err(malformed_error!("tableswitch at {} has high < low", offset));
            }
            let count = usize::try_from(i64::from(high) - i64::from(low) + 1)
                .map_err(|_| out_of_bounds_error!())?;
            if count > parser.remaining() / 4 {
                return Err(out_of_bounds_error!());
            }
            let targets = (0..count)
                .map(|_| branch_target(offset, parser.read_be()?))
                .collect::<Result<Vec<_>>>()?;
            Operands::TableSwitch {
                default,
                low,
                targets,
            }
        }
        LOOKUPSWITCH => {
            parser.align_from(0, 4)?;
            let default = branch_target(offset, parser.read_be()?)?;
            let count = parser.read_be::<i32>()?;
            let count = usize::try_from(count)
                .map_err(|_| malformed_error!("lookupswitch at {} has negative size", offset))?;
            if count > parser.remaining() / 8 {
                return Err(out_of_bounds_error!());
            }
            let pairs = (0..count)
                .map(|_| {
                    let key = parser.read_be::<i32>()?;
                    Ok((key, branch_target(offset, parser.read_be()?)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Operands::LookupSwitch { default, pairs }
        }
        INVOKEINTERFACE => {
            let index = parser.read_be()?;
            let count = parser.read_be()?;
            parser.read_be::<u8>()?;
            Operands::InvokeInterface { index, count }
        }
        INVOKEDYNAMIC => {
            let index = parser.read_be()?;
            parser.read_be::<u16>()?;
            Operands::InvokeDynamic(index)
        }
        NEWARRAY => Operands::ArrayType(parser.read_be()?),
        MULTIANEWARRAY => Operands::MultiANewArray {
            index: parser.read_be()?,
            dimensions: parser.read_be()?,
        },
        other => {
            return Err(malformed_error!(
                "Unknown opcode 0x{:02X} at {}",
                other,
                offset
            ))
        }
    };

    let length = u32::try_from(parser.pos() - offset).map_err(|_| out_of_bounds_error!())?;
    Ok(Instruction {
        offset: u32::try_from(offset).map_err(|_| out_of_bounds_error!())?,
        opcode,
        wide,
        length,
        operands,
    })
}

/// Decodes every instruction of a code array in order.
///
/// # Errors
/// Returns the first decoding error, or [`crate::Error::Malformed`] if a branch target is not
/// an instruction boundary.
pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instruction = decode(code, offset)?;
        offset += instruction.length as usize;
        instructions.push(instruction);
    }

    let mut boundaries = vec![false; code.len()];
    for instruction in &instructions {
        boundaries[instruction.offset as usize] = true;
    }
    for instruction in &instructions {
        for target in instruction.operands.targets() {
            if !boundaries.get(*target as usize).copied().unwrap_or(false) {
                return Err(malformed_error!(
                    "Branch at {} targets {} which is not an instruction boundary",
                    instruction.offset,
                    target
                ));
            }
        }
    }

    Ok(instructions)
}

/// Number of padding bytes in front of a switch's operands at `offset`.
#[must_use]
pub fn switch_padding(offset: u32) -> u32 {
    (4 - ((offset + 1) % 4)) % 4
}

/// Encoded length of an instruction placed at `offset`.
///
/// Branches are sized by their opcode: `goto_w`/`jsr_w` take four displacement bytes and
/// every other jump two.
#[must_use]
pub fn encoded_len<T>(opcode: u8, wide: bool, operands: &Operands<T>, offset: u32) -> u32 {
    match operands {
        Operands::None => 1,
        Operands::Byte(_) | Operands::ArrayType(_) => 2,
        Operands::Short(_) => 3,
        Operands::Local(_) => {
            if wide {
                4
            } else {
                2
            }
        }
        Operands::Iinc { .. } => {
            if wide {
                6
            } else {
                3
            }
        }
        Operands::Symbol(_) => {
            if opcode == LDC {
                2
            } else {
                3
            }
        }
        Operands::InvokeInterface { .. } | Operands::InvokeDynamic(_) => 5,
        Operands::MultiANewArray { .. } => 4,
        Operands::Branch(_) => {
            if matches!(opcode, GOTO_W | JSR_W) {
                5
            } else {
                3
            }
        }
        Operands::TableSwitch { targets, .. } => {
            // bounded by the code-length limit of the enclosing method
            #[allow(clippy::cast_possible_truncation)]
            let count = targets.len() as u32;
            1 + switch_padding(offset) + 12 + 4 * count
        }
        Operands::LookupSwitch { pairs, .. } => {
            #[allow(clippy::cast_possible_truncation)]
            let count = pairs.len() as u32;
            1 + switch_padding(offset) + 8 + 8 * count
        }
    }
}

/// Writes one instruction placed at `offset`, with branch targets given as displacements
/// relative to `offset`.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an operand does not fit its encoding (a local
/// index above 255 without `wide`, an `ldc` index above 255 or a 16-bit branch that is out
/// of range).
pub fn encode(
    opcode: u8,
    wide: bool,
    operands: &Operands<i32>,
    offset: u32,
    out: &mut Vec<u8>,
) -> Result<()> {
    if wide {
        out.put_be(WIDE);
    }
    out.put_be(opcode);

    match operands {
        Operands::None => {}
        Operands::Byte(value) => out.put_be(*value),
        Operands::Short(value) => out.put_be(*value),
        Operands::ArrayType(code) => out.put_be(*code),
        Operands::Local(local) => {
            if wide {
                out.put_be(*local);
            } else {
                out.put_be(u8::try_from(*local).map_err(|_| {
                    malformed_error!("Local {} needs a wide prefix", local)
                })?);
            }
        }
        Operands::Iinc { local, delta } => {
            if wide {
                out.put_be(*local);
                out.put_be(*delta);
            } else {
                out.put_be(
                    u8::try_from(*local)
                        .map_err(|_| malformed_error!("Local {} needs a wide prefix", local))?,
                );
                out.put_be(
                    i8::try_from(*delta)
                        .map_err(|_| malformed_error!("Increment {} needs a wide prefix", delta))?,
                );
            }
        }
        Operands::Symbol(index) => {
            if opcode == LDC {
                out.put_be(
                    u8::try_from(*index)
                        .map_err(|_| malformed_error!("ldc index {} exceeds 255", index))?,
                );
            } else {
                out.put_be(*index);
            }
        }
        Operands::InvokeInterface { index, count } => {
            out.put_be(*index);
            out.put_be(*count);
            out.put_be(0_u8);
        }
        Operands::InvokeDynamic(index) => {
            out.put_be(*index);
            out.put_be(0_u16);
        }
        Operands::MultiANewArray { index, dimensions } => {
            out.put_be(*index);
            out.put_be(*dimensions);
        }
        Operands::Branch(relative) => {
            if matches!(opcode, GOTO_W | JSR_W) {
                out.put_be(*relative);
            } else {
                out.put_be(i16::try_from(*relative).map_err(|_| {
                    malformed_error!("Branch displacement {} at {} exceeds 16 bits", relative, offset)
                })?);
            }
        }
        Operands::TableSwitch {
            default,
            low,
            targets,
        } => {
            for _ in 0..switch_padding(offset) {
                out.put_be(0_u8);
            }
            out.put_be(*default);
            out.put_be(*low);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            out.put_be(*low + targets.len() as i32 - 1);
            for target in targets {
                out.put_be(*target);
            }
        }
        Operands::LookupSwitch { default, pairs } => {
            for _ in 0..switch_padding(offset) {
                out.put_be(0_u8);
            }
            out.put_be(*default);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            out.put_be(pairs.len() as i32);
            for (key, target) in pairs {
                out.put_be(*key);
                out.put_be(*target);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(instructions: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::new();
        for instruction in instructions {
            let relative = instruction
                .operands
                .clone()
                .map_targets(|target| target as i32 - instruction.offset as i32);
            encode(
                instruction.opcode,
                instruction.wide,
                &relative,
                instruction.offset,
                &mut out,
            )
            .unwrap();
        }
        out
    }

    #[test]
    fn decodes_simple_sequence() {
        // iload_1; ifeq +6; iinc 1 1; return
        let code = [ILOAD_1, IFEQ, 0x00, 0x06, IINC, 0x01, 0x01, RETURN];
        let instructions = decode_all(&code).unwrap();
        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[1].operands, Operands::Branch(7));
        assert_eq!(
            instructions[2].operands,
            Operands::Iinc { local: 1, delta: 1 }
        );
        assert_eq!(encode_all(&instructions), code);
    }

    #[test]
    fn decodes_wide_and_switches() {
        let code = [
            WIDE, ILOAD, 0x01, 0x00, // wide iload 256
            TABLESWITCH, 0x00, 0x00, 0x00, // three bytes of padding
            0x00, 0x00, 0x00, 0x1C, // default -> 32
            0x00, 0x00, 0x00, 0x00, // low 0
            0x00, 0x00, 0x00, 0x01, // high 1
            0x00, 0x00, 0x00, 0x1C, 0x00, 0x00, 0x00, 0x1C, // targets
            NOP, NOP, NOP, NOP, NOP, NOP, NOP, NOP, RETURN,
        ];
        // the table starts at offset 4, operands are aligned to offset 8
        let instructions = decode_all(&code).unwrap();
        assert!(instructions[0].wide);
        assert_eq!(instructions[0].operands, Operands::Local(256));
        assert_eq!(instructions[1].length, 24);
        match &instructions[1].operands {
            Operands::TableSwitch {
                default,
                low,
                targets,
            } => {
                assert_eq!(*default, 32);
                assert_eq!(*low, 0);
                assert_eq!(targets, &vec![32, 32]);
            }
            other => panic!("unexpected operands {other:?}"),
        }
        assert_eq!(encode_all(&instructions), code);
    }

    #[test]
    fn rejects_branch_into_instruction() {
        let code = [GOTO, 0x00, 0x01, RETURN];
        assert!(decode_all(&code).is_err());
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(decode(&[0xCB], 0).is_err());
    }

    #[test]
    fn padding_is_relative_to_code_start() {
        assert_eq!(switch_padding(0), 3);
        assert_eq!(switch_padding(3), 0);
        assert_eq!(switch_padding(4), 3);
    }
}
