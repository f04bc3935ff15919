//! Label-addressed instruction streams and code relocation.
//!
//! An [`InstructionStream`] decodes a [`CodeAttribute`] into a list of instructions whose
//! branch targets, exception ranges and debug-table offsets refer to instruction identities
//! instead of byte offsets. Patches can then be spliced in anywhere and the code is laid out
//! again on [`InstructionStream::encode`]:
//!
//! - switch padding is recomputed for the new offsets,
//! - 16-bit branches whose displacement no longer fits are widened (`goto` to `goto_w`,
//!   `jsr` to `jsr_w`, a conditional branch to the inverted condition jumping over a
//!   `goto_w`),
//! - the exception table, `LineNumberTable`, `LocalVariableTable` and
//!   `LocalVariableTypeTable` are remapped,
//! - `StackMapTable` and code type annotations are dropped; the repair pass rebuilds frames.
//!
//! Instructions are addressed by their offset in the original code array. Splicing never
//! changes which original instruction an identity refers to.

use std::collections::HashMap;

use crate::{
    assembly::{
        encoder::Patch,
        instruction::{decode_all, encode, encoded_len, Operands},
        opcodes::*,
    },
    classfile::{
        code::{CodeAttribute, ExceptionEntry, RawAttribute, MAX_CODE_LENGTH},
        constants::SymbolTable,
    },
    file::{io::ByteSink, parser::Parser},
    Error, Result,
};

type NodeId = usize;

/// Identity of the position just past the last instruction.
const END: NodeId = usize::MAX;

/// Encoded size of a widened conditional branch: inverted branch plus `goto_w`.
const WIDENED_CONDITIONAL_LEN: u32 = 8;

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    opcode: u8,
    wide: bool,
    operands: Operands<NodeId>,
    /// Offset in the original code, `None` for inserted instructions
    origin: Option<u32>,
    length: u32,
}

#[derive(Debug, Clone)]
struct Handler {
    start: NodeId,
    end: NodeId,
    handler: NodeId,
    catch_type: u16,
}

#[derive(Debug, Clone)]
struct LocalEntry {
    start: NodeId,
    end: NodeId,
    name_index: u16,
    descriptor_index: u16,
    index: u16,
}

#[derive(Debug, Clone)]
enum NestedAttribute {
    LineNumbers {
        name_index: u16,
        entries: Vec<(NodeId, u16)>,
    },
    Locals {
        name_index: u16,
        entries: Vec<LocalEntry>,
    },
    Raw(RawAttribute),
}

/// A method body whose instructions can be relocated.
#[derive(Debug, Clone)]
pub struct InstructionStream {
    nodes: Vec<Node>,
    next_id: NodeId,
    by_origin: HashMap<u32, NodeId>,
    max_stack: u16,
    max_locals: u16,
    handlers: Vec<Handler>,
    attributes: Vec<NestedAttribute>,
    modified: bool,
}

impl InstructionStream {
    /// Decodes `code` into a relocatable stream.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the code does not decode or a table refers to
    /// an offset that is not an instruction boundary.
    pub fn decode(code: &CodeAttribute, symbols: &SymbolTable) -> Result<InstructionStream> {
        let instructions = decode_all(&code.code)?;
        let code_length = u32::try_from(code.code.len()).map_err(|_| out_of_bounds_error!())?;

        let by_origin: HashMap<u32, NodeId> = instructions
            .iter()
            .enumerate()
            .map(|(id, instruction)| (instruction.offset, id))
            .collect();
        let resolve = |offset: u32| -> Result<NodeId> {
            if offset == code_length {
                return Ok(END);
            }
            by_origin
                .get(&offset)
                .copied()
                .ok_or_else(|| malformed_error!("Offset {} is not an instruction boundary", offset))
        };

        let mut nodes = Vec::with_capacity(instructions.len());
        for (id, instruction) in instructions.into_iter().enumerate() {
            let mut failed = None;
            let operands = instruction.operands.map_targets(|target| {
                resolve(target).unwrap_or_else(|error| {
                    failed = Some(error);
                    END
                })
            });
            if let Some(error) = failed {
                return Err(error);
            }
            nodes.push(Node {
                id,
                opcode: instruction.opcode,
                wide: instruction.wide,
                operands,
                origin: Some(instruction.offset),
                length: instruction.length,
            });
        }

        let handlers = code
            .exception_table
            .iter()
            .map(|entry| {
                Ok(Handler {
                    start: resolve(u32::from(entry.start_pc))?,
                    end: resolve(u32::from(entry.end_pc))?,
                    handler: resolve(u32::from(entry.handler_pc))?,
                    catch_type: entry.catch_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut attributes = Vec::with_capacity(code.attributes.len());
        for attribute in &code.attributes {
            let name = symbols.utf8(attribute.name_index)?;
            match name.as_ref() {
                "LineNumberTable" => {
                    let mut parser = Parser::new(&attribute.data);
                    let count = parser.read_be::<u16>()?;
                    let mut entries = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let start = resolve(u32::from(parser.read_be::<u16>()?))?;
                        entries.push((start, parser.read_be::<u16>()?));
                    }
                    attributes.push(NestedAttribute::LineNumbers {
                        name_index: attribute.name_index,
                        entries,
                    });
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    let mut parser = Parser::new(&attribute.data);
                    let count = parser.read_be::<u16>()?;
                    let mut entries = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let start_pc = u32::from(parser.read_be::<u16>()?);
                        let length = u32::from(parser.read_be::<u16>()?);
                        entries.push(LocalEntry {
                            start: resolve(start_pc)?,
                            end: resolve(start_pc + length)?,
                            name_index: parser.read_be()?,
                            descriptor_index: parser.read_be()?,
                            index: parser.read_be()?,
                        });
                    }
                    attributes.push(NestedAttribute::Locals {
                        name_index: attribute.name_index,
                        entries,
                    });
                }
                "StackMapTable"
                | "RuntimeVisibleTypeAnnotations"
                | "RuntimeInvisibleTypeAnnotations" => {}
                _ => attributes.push(NestedAttribute::Raw(attribute.clone())),
            }
        }

        Ok(InstructionStream {
            next_id: nodes.len(),
            nodes,
            by_origin,
            max_stack: code.max_stack,
            max_locals: code.max_locals,
            handlers,
            attributes,
            modified: false,
        })
    }

    /// Returns `true` once a patch has been spliced in.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Number of instructions currently in the stream.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the stream holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Overwrites the original instruction at `offset` with `nop`s of the same width and
    /// splices `patch` in right after them.
    ///
    /// Jumps that targeted the replaced instruction land on the first `nop`; jumps that
    /// targeted the following instruction still reach it after the patch. A branch inside
    /// the patch to the patch's end continues at the following instruction.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no original instruction starts at `offset`
    /// (including one that was already substituted) or if the patch does not decode.
    pub fn substitute(&mut self, offset: u32, patch: &Patch) -> Result<()> {
        let position = self.position_of_origin(offset)?;
        let replaced = self.nodes[position].clone();

        let mut padding = Vec::with_capacity(replaced.length as usize);
        for nop in 0..replaced.length {
            let id = if nop == 0 { replaced.id } else { self.fresh_id() };
            padding.push(Node {
                id,
                opcode: NOP,
                wide: false,
                operands: Operands::None,
                origin: None,
                length: 1,
            });
        }
        let width = padding.len();
        self.nodes.splice(position..=position, padding);

        self.splice_patch(position + width, patch)
    }

    /// Splices `patch` in right after the original instruction at `offset`, keeping that
    /// instruction.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no original instruction starts at `offset` or
    /// if the patch does not decode.
    pub fn insert_after(&mut self, offset: u32, patch: &Patch) -> Result<()> {
        let position = self.position_of_origin(offset)?;
        self.splice_patch(position + 1, patch)
    }

    /// Lays the stream out again and produces the updated `Code` attribute.
    ///
    /// `max_stack` and `max_locals` are carried over; the repair pass recomputes them.
    ///
    /// # Errors
    /// Returns [`crate::Error::CodeTooLarge`] if the laid-out code exceeds 65535 bytes and
    /// [`crate::Error::Malformed`] if an instruction cannot be encoded.
    pub fn encode(&self, method: &str) -> Result<CodeAttribute> {
        let mut widened = vec![false; self.nodes.len()];
        let offsets = loop {
            let offsets = self.layout(&widened)?;
            let mut changed = false;
            for (position, node) in self.nodes.iter().enumerate() {
                if widened[position] || !is_short_branch(node.opcode) {
                    continue;
                }
                if let Operands::Branch(target) = &node.operands {
                    let displacement =
                        i64::from(offsets.of(*target)) - i64::from(offsets.of(node.id));
                    if i16::try_from(displacement).is_err() {
                        widened[position] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break offsets;
            }
        };

        if offsets.total as usize > MAX_CODE_LENGTH {
            return Err(Error::CodeTooLarge {
                method: method.to_string(),
                size: offsets.total as usize,
            });
        }

        let mut code = Vec::with_capacity(offsets.total as usize);
        for (position, node) in self.nodes.iter().enumerate() {
            let offset = offsets.of(node.id);
            let relative = node.operands.clone().map_targets(|target| {
                // bounded by MAX_CODE_LENGTH
                #[allow(clippy::cast_possible_wrap)]
                let displacement = offsets.of(target) as i32 - offset as i32;
                displacement
            });

            if !widened[position] {
                encode(node.opcode, node.wide, &relative, offset, &mut code)?;
                continue;
            }

            let Operands::Branch(displacement) = relative else {
                return Err(malformed_error!("Only branches can be widened"));
            };
            match node.opcode {
                GOTO => encode(GOTO_W, false, &Operands::Branch(displacement), offset, &mut code)?,
                JSR => encode(JSR_W, false, &Operands::Branch(displacement), offset, &mut code)?,
                opcode => {
                    let Some(inverted) = invert_branch(opcode) else {
                        return Err(malformed_error!("Cannot widen opcode 0x{:02X}", opcode));
                    };
                    encode(
                        inverted,
                        false,
                        &Operands::Branch(WIDENED_CONDITIONAL_LEN as i32),
                        offset,
                        &mut code,
                    )?;
                    encode(
                        GOTO_W,
                        false,
                        &Operands::Branch(displacement - 3),
                        offset + 3,
                        &mut code,
                    )?;
                }
            }
        }

        let exception_table = self
            .handlers
            .iter()
            .map(|handler| {
                Ok(ExceptionEntry {
                    start_pc: offsets.of_u16(handler.start)?,
                    end_pc: offsets.of_u16(handler.end)?,
                    handler_pc: offsets.of_u16(handler.handler)?,
                    catch_type: handler.catch_type,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for attribute in &self.attributes {
            match attribute {
                NestedAttribute::LineNumbers {
                    name_index,
                    entries,
                } => {
                    let mut data = Vec::with_capacity(2 + entries.len() * 4);
                    data.put_be(u16::try_from(entries.len()).map_err(|_| out_of_bounds_error!())?);
                    for (start, line) in entries {
                        data.put_be(offsets.of_u16(*start)?);
                        data.put_be(*line);
                    }
                    attributes.push(RawAttribute {
                        name_index: *name_index,
                        data,
                    });
                }
                NestedAttribute::Locals {
                    name_index,
                    entries,
                } => {
                    let mut data = Vec::with_capacity(2 + entries.len() * 10);
                    data.put_be(u16::try_from(entries.len()).map_err(|_| out_of_bounds_error!())?);
                    for entry in entries {
                        let start = offsets.of_u16(entry.start)?;
                        let end = offsets.of_u16(entry.end)?;
                        data.put_be(start);
                        data.put_be(end.saturating_sub(start));
                        data.put_be(entry.name_index);
                        data.put_be(entry.descriptor_index);
                        data.put_be(entry.index);
                    }
                    attributes.push(RawAttribute {
                        name_index: *name_index,
                        data,
                    });
                }
                NestedAttribute::Raw(raw) => attributes.push(raw.clone()),
            }
        }

        Ok(CodeAttribute {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn position_of_origin(&self, offset: u32) -> Result<usize> {
        let id = self
            .by_origin
            .get(&offset)
            .copied()
            .ok_or_else(|| malformed_error!("No instruction at offset {}", offset))?;
        self.nodes
            .iter()
            .position(|node| node.id == id && node.origin == Some(offset))
            .ok_or_else(|| malformed_error!("Instruction at offset {} was already replaced", offset))
    }

    fn splice_patch(&mut self, position: usize, patch: &Patch) -> Result<()> {
        let decoded = decode_all(&patch.code)?;
        let patch_length = u32::try_from(patch.code.len()).map_err(|_| out_of_bounds_error!())?;
        let following = self.nodes.get(position).map_or(END, |node| node.id);

        let ids: HashMap<u32, NodeId> = decoded
            .iter()
            .map(|instruction| (instruction.offset, self.fresh_id()))
            .collect();

        let mut inserted = Vec::with_capacity(decoded.len());
        for instruction in decoded {
            let operands = instruction.operands.map_targets(|target| {
                if target == patch_length {
                    following
                } else {
                    // decode_all verified every target is a boundary inside the patch
                    ids.get(&target).copied().unwrap_or(following)
                }
            });
            inserted.push(Node {
                id: ids[&instruction.offset],
                opcode: instruction.opcode,
                wide: instruction.wide,
                operands,
                origin: None,
                length: instruction.length,
            });
        }

        self.nodes.splice(position..position, inserted);
        self.modified = true;
        Ok(())
    }

    fn layout(&self, widened: &[bool]) -> Result<Offsets> {
        let mut by_id = HashMap::with_capacity(self.nodes.len());
        let mut offset = 0_u32;
        for (position, node) in self.nodes.iter().enumerate() {
            by_id.insert(node.id, offset);
            let size = if widened[position] {
                match node.opcode {
                    GOTO | JSR => 5,
                    _ => WIDENED_CONDITIONAL_LEN,
                }
            } else {
                encoded_len(node.opcode, node.wide, &node.operands, offset)
            };
            offset = offset
                .checked_add(size)
                .ok_or_else(|| out_of_bounds_error!())?;
        }
        Ok(Offsets {
            by_id,
            total: offset,
        })
    }
}

fn is_short_branch(opcode: u8) -> bool {
    matches!(opcode, GOTO | JSR) || is_conditional_branch(opcode)
}

struct Offsets {
    by_id: HashMap<NodeId, u32>,
    total: u32,
}

impl Offsets {
    fn of(&self, id: NodeId) -> u32 {
        if id == END {
            return self.total;
        }
        self.by_id.get(&id).copied().unwrap_or(self.total)
    }

    fn of_u16(&self, id: NodeId) -> Result<u16> {
        u16::try_from(self.of(id)).map_err(|_| out_of_bounds_error!())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{encoder::PatchEncoder, instruction::decode_all};

    fn code(bytes: Vec<u8>) -> CodeAttribute {
        CodeAttribute {
            max_stack: 2,
            max_locals: 2,
            code: bytes,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn two_nops(symbols: &mut SymbolTable) -> Patch {
        let mut encoder = PatchEncoder::new(symbols);
        encoder.op(NOP).unwrap();
        encoder.op(NOP).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn untouched_stream_reencodes_identically() -> Result<()> {
        let symbols = SymbolTable::new();
        let original = code(vec![ILOAD_1, IFEQ, 0x00, 0x04, ICONST_1, IRETURN]);
        let stream = InstructionStream::decode(&original, &symbols)?;
        assert!(!stream.is_modified());
        assert_eq!(stream.encode("m()V")?, original);
        Ok(())
    }

    #[test]
    fn substitute_keeps_targets_on_nops() -> Result<()> {
        let mut symbols = SymbolTable::new();
        // 0: goto 3 | 3: iload_1 | 4: pop | 5: return
        let original = code(vec![GOTO, 0x00, 0x03, ILOAD_1, POP, RETURN]);
        let mut stream = InstructionStream::decode(&original, &symbols)?;

        let patch = two_nops(&mut symbols);
        stream.substitute(3, &patch)?;
        assert!(stream.is_modified());

        let encoded = stream.encode("m()V")?;
        // iload_1 became one nop followed by the two-nop patch
        assert_eq!(encoded.code, vec![GOTO, 0x00, 0x03, NOP, NOP, NOP, POP, RETURN]);
        assert!(stream.substitute(3, &patch).is_err());
        Ok(())
    }

    #[test]
    fn patch_end_label_continues_at_following_instruction() -> Result<()> {
        let mut symbols = SymbolTable::new();
        let original = code(vec![ICONST_0, POP, RETURN]);
        let mut stream = InstructionStream::decode(&original, &symbols)?;

        let mut encoder = PatchEncoder::new(&mut symbols);
        encoder.branch(GOTO, "end")?;
        encoder.op(NOP)?;
        encoder.define_label("end")?;
        let patch = encoder.finish()?;
        stream.insert_after(0, &patch)?;

        let encoded = stream.encode("m()V")?;
        let instructions = decode_all(&encoded.code)?;
        // iconst_0 | goto -> pop | nop | pop | return
        assert_eq!(instructions[1].opcode, GOTO);
        assert_eq!(instructions[1].operands, Operands::Branch(5));
        assert_eq!(instructions[3].opcode, POP);
        assert_eq!(instructions[3].offset, 5);
        Ok(())
    }

    #[test]
    fn exception_ranges_cover_spliced_code() -> Result<()> {
        let mut symbols = SymbolTable::new();
        let mut original = code(vec![ICONST_0, POP, RETURN, ATHROW]);
        original.exception_table.push(ExceptionEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 3,
            catch_type: 0,
        });
        let mut stream = InstructionStream::decode(&original, &symbols)?;
        let patch = two_nops(&mut symbols);
        stream.substitute(1, &patch)?;

        let encoded = stream.encode("m()V")?;
        assert_eq!(
            encoded.exception_table[0],
            ExceptionEntry {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 5,
                catch_type: 0,
            }
        );
        Ok(())
    }

    #[test]
    fn overflowing_branches_are_widened() -> Result<()> {
        let mut symbols = SymbolTable::new();
        // 0: iload_1 | 1: ifeq -> 7 | 4: goto -> 7 | 7: return
        let original = code(vec![ILOAD_1, IFEQ, 0x00, 0x06, GOTO, 0x00, 0x03, RETURN]);
        let mut stream = InstructionStream::decode(&original, &symbols)?;

        let mut encoder = PatchEncoder::new(&mut symbols);
        for _ in 0..40_000 {
            encoder.op(NOP)?;
        }
        let patch = encoder.finish()?;
        stream.insert_after(4, &patch)?;

        let encoded = stream.encode("m()V")?;
        let instructions = decode_all(&encoded.code)?;
        let return_offset = instructions[instructions.len() - 1].offset;

        // ifeq became ifne over a goto_w, goto became goto_w
        assert_eq!(instructions[1].opcode, IFNE);
        assert_eq!(instructions[1].operands, Operands::Branch(9));
        assert_eq!(instructions[2].opcode, GOTO_W);
        assert_eq!(instructions[2].operands, Operands::Branch(return_offset));
        assert_eq!(instructions[3].opcode, GOTO_W);
        assert_eq!(instructions[3].operands, Operands::Branch(return_offset));
        Ok(())
    }

    #[test]
    fn oversized_code_is_rejected() -> Result<()> {
        let mut symbols = SymbolTable::new();
        let original = code(vec![RETURN]);
        let mut stream = InstructionStream::decode(&original, &symbols)?;
        let mut encoder = PatchEncoder::new(&mut symbols);
        for _ in 0..MAX_CODE_LENGTH {
            encoder.op(NOP)?;
        }
        let patch = encoder.finish()?;
        stream.substitute(0, &patch)?;
        assert!(matches!(
            stream.encode("m()V"),
            Err(Error::CodeTooLarge { size, .. }) if size == MAX_CODE_LENGTH + 1
        ));
        Ok(())
    }
}
