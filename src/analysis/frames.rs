//! Abstract interpretation over verification types.
//!
//! The analyzer walks a method body with a worklist, carrying a [`Frame`] of verification
//! types for the local variables and the operand stack. Frames are recorded at every block
//! start (branch and switch targets, exception handlers and instructions that follow an
//! unconditional transfer) and merged when several paths meet. Reference merges go through a
//! [`TypeHierarchy`]; a type it cannot describe aborts the analysis with
//! [`RepairError::MissingType`].
//!
//! Both locals and stack are kept in slot form: a `long` or `double` occupies its own entry
//! followed by [`VType::Top`]. The stack-map encoder collapses the pairs again.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use strum::Display;

use crate::{
    assembly::{
        instruction::{decode_all, Instruction, Operands},
        opcodes::*,
    },
    classfile::{
        code::ExceptionEntry,
        constants::{Symbol, SymbolTable},
        descriptor::{FieldType, MethodDescriptor},
    },
    file::io::ByteSink,
    RepairError,
};

/// Internal name of the root class.
pub const OBJECT: &str = "java/lang/Object";
/// Internal name of the root of all exceptions.
pub const THROWABLE: &str = "java/lang/Throwable";

/// What the analyzer needs to know about one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Internal name of the superclass, `None` for `java/lang/Object`
    pub super_name: Option<String>,
    /// `true` for interfaces
    pub is_interface: bool,
}

/// Source of superclass information for reference merges.
pub trait TypeHierarchy: Send + Sync {
    /// Describes `name`, or returns `None` if the type cannot currently be resolved.
    fn lookup(&self, name: &str) -> Option<TypeInfo>;
}

/// A hierarchy that treats every unknown type as a direct subclass of `java/lang/Object`.
///
/// Merges under it never fail, which is all max-stack computation needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LenientHierarchy;

impl TypeHierarchy for LenientHierarchy {
    fn lookup(&self, name: &str) -> Option<TypeInfo> {
        Some(TypeInfo {
            super_name: (name != OBJECT).then(|| OBJECT.to_string()),
            is_interface: false,
        })
    }
}

/// Answers for the unit under analysis before deferring to the host's hierarchy, since a
/// unit being loaded is not yet known to its loader.
pub(crate) struct ScopedHierarchy<'a> {
    pub name: &'a str,
    pub info: TypeInfo,
    pub inner: &'a dyn TypeHierarchy,
}

impl TypeHierarchy for ScopedHierarchy<'_> {
    fn lookup(&self, name: &str) -> Option<TypeInfo> {
        if name == self.name {
            return Some(self.info.clone());
        }
        if name == OBJECT {
            return Some(TypeInfo {
                super_name: None,
                is_interface: false,
            });
        }
        self.inner.lookup(name)
    }
}

/// A verification type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub enum VType {
    /// Unusable slot, also the second half of a `long`/`double`
    Top,
    /// `int`, `short`, `char`, `byte`, `boolean`
    Integer,
    /// `float`
    Float,
    /// `long` (first slot)
    Long,
    /// `double` (first slot)
    Double,
    /// The `null` reference
    Null,
    /// `this` in a constructor before the superclass constructor ran
    UninitializedThis,
    /// Result of the `new` at the given offset before its constructor ran
    Uninitialized(u32),
    /// An initialized reference of the named class or array type
    Object(String),
}

impl VType {
    /// The verification type of a value of field type `field`.
    #[must_use]
    pub fn from_field(field: &FieldType) -> VType {
        match field {
            FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Boolean
            | FieldType::Int => VType::Integer,
            FieldType::Float => VType::Float,
            FieldType::Long => VType::Long,
            FieldType::Double => VType::Double,
            FieldType::Object(name) | FieldType::Array(name) => VType::Object(name.clone()),
        }
    }

    /// Returns `true` for `long` and `double`.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    /// Returns `true` for every reference type, initialized or not.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            VType::Null | VType::UninitializedThis | VType::Uninitialized(_) | VType::Object(_)
        )
    }
}

/// Locals and operand stack at one program point, in slot form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Local-variable slots
    pub locals: Vec<VType>,
    /// Operand-stack slots, bottom first
    pub stack: Vec<VType>,
}

impl Frame {
    fn push(&mut self, value: VType) {
        let wide = value.is_wide();
        self.stack.push(value);
        if wide {
            self.stack.push(VType::Top);
        }
    }

    fn pop_slot(&mut self, offset: u32) -> Result<VType, RepairError> {
        self.stack
            .pop()
            .ok_or_else(|| invalid(offset, "operand stack underflow"))
    }

    fn pop_slots(&mut self, count: usize, offset: u32) -> Result<(), RepairError> {
        if self.stack.len() < count {
            return Err(invalid(offset, "operand stack underflow"));
        }
        self.stack.truncate(self.stack.len() - count);
        Ok(())
    }

    /// Pops one value, both slots for a `long`/`double`.
    fn pop_value(&mut self, offset: u32) -> Result<VType, RepairError> {
        let top = self.pop_slot(offset)?;
        if top == VType::Top && self.stack.last().is_some_and(VType::is_wide) {
            return self.pop_slot(offset);
        }
        Ok(top)
    }

    fn replace_all(&mut self, from: &VType, to: &VType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == from {
                *slot = to.clone();
            }
        }
    }
}

fn invalid(offset: u32, message: impl Into<String>) -> RepairError {
    RepairError::Invalid {
        offset,
        message: message.into(),
    }
}

/// Result of analyzing one method body.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Highest operand-stack depth in slots
    pub max_stack: u16,
    /// Input frames of every reached block start
    pub frames: HashMap<u32, Frame>,
    /// Offsets that need an explicit stack-map frame, ascending
    pub frame_offsets: Vec<u32>,
    /// Unreached blocks as `[start, end)` ranges
    pub dead_ranges: Vec<(u32, u32)>,
}

/// Everything about the method that the analyzer needs besides its code.
pub struct MethodContext<'a> {
    /// Internal name of the declaring unit
    pub owner: &'a str,
    /// Method name
    pub name: &'a str,
    /// Method descriptor
    pub descriptor: &'a str,
    /// `true` for static methods
    pub is_static: bool,
    /// Declared number of local slots
    pub max_locals: u16,
    /// `true` to accept `jsr`/`ret` (units without stack maps)
    pub allow_subroutines: bool,
}

struct Analyzer<'a> {
    symbols: &'a SymbolTable,
    hierarchy: &'a dyn TypeHierarchy,
    method: &'a MethodContext<'a>,
    instructions: Vec<Instruction>,
    index_of: HashMap<u32, usize>,
    handlers: &'a [ExceptionEntry],
    block_starts: BTreeSet<u32>,
    frames: HashMap<u32, Frame>,
    worklist: VecDeque<u32>,
    queued: HashSet<u32>,
    max_stack: usize,
}

/// Runs the analysis over `code`.
///
/// # Errors
/// Returns [`RepairError::MissingType`] if a reference merge needs a type the hierarchy
/// cannot describe and [`RepairError::Invalid`] for code that cannot be given consistent
/// frames.
pub fn analyze(
    code: &[u8],
    handlers: &[ExceptionEntry],
    symbols: &SymbolTable,
    hierarchy: &dyn TypeHierarchy,
    method: &MethodContext<'_>,
) -> Result<Analysis, RepairError> {
    let instructions =
        decode_all(code).map_err(|error| invalid(0, format!("undecodable code: {error}")))?;
    let index_of = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.offset, index))
        .collect::<HashMap<_, _>>();
    let code_length = u32::try_from(code.len()).map_err(|_| invalid(0, "code too long"))?;

    let mut block_starts = BTreeSet::new();
    let mut targeted = HashSet::new();
    block_starts.insert(0);
    for instruction in &instructions {
        for target in instruction.operands.targets() {
            block_starts.insert(*target);
            targeted.insert(*target);
        }
        let follows_transfer = ends_block(instruction.opcode)
            || matches!(instruction.opcode, JSR | JSR_W);
        if follows_transfer && instruction.next_offset() < code_length {
            block_starts.insert(instruction.next_offset());
        }
    }
    for handler in handlers {
        let start = u32::from(handler.handler_pc);
        if !index_of.contains_key(&start) {
            return Err(invalid(start, "exception handler is not an instruction boundary"));
        }
        block_starts.insert(start);
        targeted.insert(start);
    }

    let mut analyzer = Analyzer {
        symbols,
        hierarchy,
        method,
        instructions,
        index_of,
        handlers,
        block_starts,
        frames: HashMap::new(),
        worklist: VecDeque::new(),
        queued: HashSet::new(),
        max_stack: 0,
    };

    let initial = analyzer.initial_frame()?;
    analyzer.merge_into(0, initial)?;
    while let Some(start) = analyzer.worklist.pop_front() {
        analyzer.queued.remove(&start);
        analyzer.run_block(start)?;
    }

    let mut frame_offsets = Vec::new();
    let mut dead_ranges = Vec::new();
    let starts: Vec<u32> = analyzer.block_starts.iter().copied().collect();
    for (position, start) in starts.iter().enumerate() {
        let end = starts.get(position + 1).copied().unwrap_or(code_length);
        if !analyzer.frames.contains_key(start) {
            dead_ranges.push((*start, end));
        }
        if *start != 0 || targeted.contains(start) {
            frame_offsets.push(*start);
        }
    }

    Ok(Analysis {
        max_stack: u16::try_from(analyzer.max_stack)
            .map_err(|_| invalid(0, "operand stack deeper than 65535"))?,
        frames: analyzer.frames,
        frame_offsets,
        dead_ranges,
    })
}

impl Analyzer<'_> {
    fn initial_frame(&self) -> Result<Frame, RepairError> {
        let descriptor = MethodDescriptor::parse(self.method.descriptor)
            .map_err(|error| invalid(0, error.to_string()))?;

        let mut frame = Frame {
            locals: Vec::new(),
            stack: Vec::new(),
        };
        if !self.method.is_static {
            if self.method.name == "<init>" && self.method.owner != OBJECT {
                frame.locals.push(VType::UninitializedThis);
            } else {
                frame.locals.push(VType::Object(self.method.owner.to_string()));
            }
        }
        for parameter in &descriptor.parameters {
            let value = VType::from_field(parameter);
            let wide = value.is_wide();
            frame.locals.push(value);
            if wide {
                frame.locals.push(VType::Top);
            }
        }

        let declared = usize::from(self.method.max_locals);
        if frame.locals.len() > declared {
            return Err(invalid(0, "arguments exceed max_locals"));
        }
        frame.locals.resize(declared, VType::Top);
        Ok(frame)
    }

    fn run_block(&mut self, start: u32) -> Result<(), RepairError> {
        let Some(mut frame) = self.frames.get(&start).cloned() else {
            return Ok(());
        };
        let Some(mut index) = self.index_of.get(&start).copied() else {
            return Err(invalid(start, "block start is not an instruction boundary"));
        };

        loop {
            let instruction = self.instructions[index].clone();
            let offset = instruction.offset;
            self.max_stack = self.max_stack.max(frame.stack.len());

            let covering: Vec<ExceptionEntry> = self
                .handlers
                .iter()
                .filter(|entry| {
                    u32::from(entry.start_pc) <= offset && offset < u32::from(entry.end_pc)
                })
                .copied()
                .collect();
            for entry in &covering {
                self.merge_handler(entry, &frame.locals)?;
            }

            let before = frame.locals.clone();
            self.execute(&instruction, &mut frame)?;
            self.max_stack = self.max_stack.max(frame.stack.len());
            if frame.locals != before {
                for entry in &covering {
                    self.merge_handler(entry, &frame.locals)?;
                }
            }

            match &instruction.operands {
                Operands::Branch(target) => {
                    if matches!(instruction.opcode, JSR | JSR_W) {
                        let mut entered = frame.clone();
                        entered.stack.push(VType::Top);
                        self.max_stack = self.max_stack.max(entered.stack.len());
                        self.merge_into(*target, entered)?;
                    } else {
                        self.merge_into(*target, frame.clone())?;
                    }
                }
                Operands::TableSwitch {
                    default, targets, ..
                } => {
                    for target in std::iter::once(default).chain(targets.iter()) {
                        self.merge_into(*target, frame.clone())?;
                    }
                }
                Operands::LookupSwitch { default, pairs } => {
                    for target in std::iter::once(default).chain(pairs.iter().map(|(_, t)| t)) {
                        self.merge_into(*target, frame.clone())?;
                    }
                }
                _ => {}
            }

            if ends_block(instruction.opcode) {
                return Ok(());
            }

            index += 1;
            let Some(next) = self.instructions.get(index) else {
                return Err(invalid(offset, "execution falls off the end of the code"));
            };
            if self.block_starts.contains(&next.offset) {
                return self.merge_into(next.offset, frame);
            }
        }
    }

    fn merge_handler(&mut self, entry: &ExceptionEntry, locals: &[VType]) -> Result<(), RepairError> {
        let caught = if entry.catch_type == 0 {
            THROWABLE.to_string()
        } else {
            self.symbols
                .class_name(entry.catch_type)
                .map_err(|error| invalid(u32::from(entry.handler_pc), error.to_string()))?
                .into_owned()
        };
        let frame = Frame {
            locals: locals.to_vec(),
            stack: vec![VType::Object(caught)],
        };
        self.merge_into(u32::from(entry.handler_pc), frame)
    }

    fn merge_into(&mut self, target: u32, incoming: Frame) -> Result<(), RepairError> {
        let merged = match self.frames.get(&target) {
            None => incoming,
            Some(existing) => {
                if existing.stack.len() != incoming.stack.len() {
                    return Err(invalid(
                        target,
                        format!(
                            "inconsistent stack heights {} and {}",
                            existing.stack.len(),
                            incoming.stack.len()
                        ),
                    ));
                }
                let mut merged = existing.clone();
                for (slot, other) in merged.locals.iter_mut().zip(&incoming.locals) {
                    *slot = self.merge_value(slot, other)?.unwrap_or(VType::Top);
                }
                for (slot, other) in merged.stack.iter_mut().zip(&incoming.stack) {
                    let Some(value) = self.merge_value(slot, other)? else {
                        return Err(invalid(
                            target,
                            format!("incompatible stack values {slot} and {other}"),
                        ));
                    };
                    *slot = value;
                }
                if &merged == existing {
                    return Ok(());
                }
                merged
            }
        };

        self.frames.insert(target, merged);
        if self.queued.insert(target) {
            self.worklist.push_back(target);
        }
        Ok(())
    }

    /// Least common type of `a` and `b`, `None` if they have none.
    fn merge_value(&self, a: &VType, b: &VType) -> Result<Option<VType>, RepairError> {
        if a == b {
            return Ok(Some(a.clone()));
        }
        Ok(match (a, b) {
            (VType::Null, VType::Object(_)) => Some(b.clone()),
            (VType::Object(_), VType::Null) => Some(a.clone()),
            (VType::Object(x), VType::Object(y)) => Some(VType::Object(self.common_super(x, y)?)),
            _ => None,
        })
    }

    fn describe(&self, name: &str) -> Result<TypeInfo, RepairError> {
        self.hierarchy
            .lookup(name)
            .ok_or_else(|| RepairError::MissingType(name.to_string()))
    }

    fn common_super(&self, a: &str, b: &str) -> Result<String, RepairError> {
        if a == OBJECT || b == OBJECT || a.starts_with('[') || b.starts_with('[') {
            return Ok(OBJECT.to_string());
        }

        let first = self.describe(a)?;
        let second = self.describe(b)?;
        if first.is_interface || second.is_interface {
            return Ok(OBJECT.to_string());
        }

        let mut ancestors = HashSet::new();
        ancestors.insert(a.to_string());
        let mut current = first.super_name;
        while let Some(name) = current {
            current = self.describe(&name)?.super_name;
            ancestors.insert(name);
        }

        if ancestors.contains(b) {
            return Ok(b.to_string());
        }
        let mut current = second.super_name;
        while let Some(name) = current {
            if ancestors.contains(&name) {
                return Ok(name);
            }
            current = self.describe(&name)?.super_name;
        }
        Ok(OBJECT.to_string())
    }

    fn class_operand(&self, instruction: &Instruction) -> Result<String, RepairError> {
        let index = instruction
            .symbol()
            .ok_or_else(|| invalid(instruction.offset, "missing class operand"))?;
        self.symbols
            .class_name(index)
            .map(std::borrow::Cow::into_owned)
            .map_err(|error| invalid(instruction.offset, error.to_string()))
    }

    fn constant_type(&self, instruction: &Instruction) -> Result<VType, RepairError> {
        let offset = instruction.offset;
        let index = instruction
            .symbol()
            .ok_or_else(|| invalid(offset, "missing constant operand"))?;
        Ok(match self.symbols.get(index) {
            Some(Symbol::Integer(_)) => VType::Integer,
            Some(Symbol::Float(_)) => VType::Float,
            Some(Symbol::Long(_)) => VType::Long,
            Some(Symbol::Double(_)) => VType::Double,
            Some(Symbol::String { .. }) => VType::Object("java/lang/String".to_string()),
            Some(Symbol::Class { .. }) => VType::Object("java/lang/Class".to_string()),
            Some(Symbol::MethodType { .. }) => {
                VType::Object("java/lang/invoke/MethodType".to_string())
            }
            Some(Symbol::MethodHandle { .. }) => {
                VType::Object("java/lang/invoke/MethodHandle".to_string())
            }
            Some(Symbol::Dynamic { name_and_type, .. }) => {
                let (_, descriptor) = self
                    .symbols
                    .name_and_type(*name_and_type)
                    .map_err(|error| invalid(offset, error.to_string()))?;
                VType::from_field(
                    &FieldType::parse(&descriptor).map_err(|error| invalid(offset, error.to_string()))?,
                )
            }
            other => return Err(invalid(offset, format!("ldc of unsupported constant {other:?}"))),
        })
    }

    fn load(&self, frame: &mut Frame, kind: u8, local: u16, offset: u32) -> Result<(), RepairError> {
        let index = usize::from(local);
        let Some(value) = frame.locals.get(index).cloned() else {
            return Err(invalid(offset, format!("load of local {local} beyond max_locals")));
        };
        match kind {
            0 => frame.push(VType::Integer),
            1 => frame.push(VType::Long),
            2 => frame.push(VType::Float),
            3 => frame.push(VType::Double),
            _ => {
                if !value.is_reference() {
                    return Err(invalid(offset, format!("aload of non-reference local {local}")));
                }
                frame.push(value);
            }
        }
        Ok(())
    }

    fn store(&self, frame: &mut Frame, local: u16, offset: u32) -> Result<(), RepairError> {
        let index = usize::from(local);
        let value = frame.pop_value(offset)?;
        let width = if value.is_wide() { 2 } else { 1 };
        if index + width > frame.locals.len() {
            return Err(invalid(offset, format!("store to local {local} beyond max_locals")));
        }
        if index > 0 && frame.locals[index - 1].is_wide() {
            frame.locals[index - 1] = VType::Top;
        }
        frame.locals[index] = value;
        if width == 2 {
            frame.locals[index + 1] = VType::Top;
        }
        Ok(())
    }

    fn element_type(array: &VType) -> VType {
        match array {
            VType::Object(name) if name.starts_with('[') => FieldType::parse(&name[1..])
                .map_or_else(|_| VType::Object(OBJECT.to_string()), |e| VType::from_field(&e)),
            VType::Null => VType::Null,
            _ => VType::Object(OBJECT.to_string()),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&self, instruction: &Instruction, frame: &mut Frame) -> Result<(), RepairError> {
        let offset = instruction.offset;
        let opcode = instruction.opcode;

        if let Some((pops, result)) = arithmetic(opcode) {
            frame.pop_slots(pops, offset)?;
            frame.push(result);
            return Ok(());
        }

        match opcode {
            NOP | GOTO | GOTO_W | RETURN | IINC => {}
            ACONST_NULL => frame.push(VType::Null),
            ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => frame.push(VType::Integer),
            LCONST_0 | LCONST_1 => frame.push(VType::Long),
            FCONST_0..=FCONST_2 => frame.push(VType::Float),
            DCONST_0 | DCONST_1 => frame.push(VType::Double),
            LDC | LDC_W | LDC2_W => frame.push(self.constant_type(instruction)?),
            ILOAD..=ALOAD => {
                let Operands::Local(local) = instruction.operands else {
                    return Err(invalid(offset, "load without local operand"));
                };
                self.load(frame, opcode - ILOAD, local, offset)?;
            }
            ILOAD_0..=ALOAD_3 => {
                let relative = opcode - ILOAD_0;
                self.load(frame, relative / 4, u16::from(relative % 4), offset)?;
            }
            IALOAD | BALOAD | CALOAD | SALOAD => {
                frame.pop_slots(2, offset)?;
                frame.push(VType::Integer);
            }
            LALOAD => {
                frame.pop_slots(2, offset)?;
                frame.push(VType::Long);
            }
            FALOAD => {
                frame.pop_slots(2, offset)?;
                frame.push(VType::Float);
            }
            DALOAD => {
                frame.pop_slots(2, offset)?;
                frame.push(VType::Double);
            }
            AALOAD => {
                frame.pop_slot(offset)?;
                let array = frame.pop_value(offset)?;
                frame.push(Self::element_type(&array));
            }
            ISTORE..=ASTORE => {
                let Operands::Local(local) = instruction.operands else {
                    return Err(invalid(offset, "store without local operand"));
                };
                self.store(frame, local, offset)?;
            }
            ISTORE_0..=ASTORE_3 => {
                self.store(frame, u16::from((opcode - ISTORE_0) % 4), offset)?;
            }
            IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => {
                frame.pop_slots(3, offset)?;
            }
            LASTORE | DASTORE => frame.pop_slots(4, offset)?,
            POP => frame.pop_slots(1, offset)?,
            POP2 => frame.pop_slots(2, offset)?,
            DUP => {
                let v1 = frame.pop_slot(offset)?;
                frame.stack.extend([v1.clone(), v1]);
            }
            DUP_X1 => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                frame.stack.extend([v1.clone(), v2, v1]);
            }
            DUP_X2 => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                let v3 = frame.pop_slot(offset)?;
                frame.stack.extend([v1.clone(), v3, v2, v1]);
            }
            DUP2 => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                frame.stack.extend([v2.clone(), v1.clone(), v2, v1]);
            }
            DUP2_X1 => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                let v3 = frame.pop_slot(offset)?;
                frame.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
            }
            DUP2_X2 => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                let v3 = frame.pop_slot(offset)?;
                let v4 = frame.pop_slot(offset)?;
                frame.stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
            }
            SWAP => {
                let v1 = frame.pop_slot(offset)?;
                let v2 = frame.pop_slot(offset)?;
                frame.stack.extend([v1, v2]);
            }
            IFEQ..=IFLE | IFNULL | IFNONNULL | TABLESWITCH | LOOKUPSWITCH => {
                frame.pop_slots(1, offset)?;
            }
            IF_ICMPEQ..=IF_ACMPNE => frame.pop_slots(2, offset)?,
            JSR | JSR_W | RET => {
                if !self.method.allow_subroutines {
                    return Err(invalid(offset, "subroutine in a unit with stack maps"));
                }
            }
            IRETURN | FRETURN | ARETURN | ATHROW | MONITORENTER | MONITOREXIT => {
                frame.pop_slots(1, offset)?;
            }
            LRETURN | DRETURN => frame.pop_slots(2, offset)?,
            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                let field = self.member_type(instruction)?;
                let slots = usize::from(field.slots());
                match opcode {
                    GETSTATIC => frame.push(VType::from_field(&field)),
                    PUTSTATIC => frame.pop_slots(slots, offset)?,
                    GETFIELD => {
                        frame.pop_slots(1, offset)?;
                        frame.push(VType::from_field(&field));
                    }
                    _ => frame.pop_slots(slots + 1, offset)?,
                }
            }
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE | INVOKEDYNAMIC => {
                self.invoke(instruction, frame)?;
            }
            NEW => frame.push(VType::Uninitialized(offset)),
            NEWARRAY => {
                let Operands::ArrayType(code) = instruction.operands else {
                    return Err(invalid(offset, "newarray without element type"));
                };
                let descriptor = match code {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    other => return Err(invalid(offset, format!("newarray type {other}"))),
                };
                frame.pop_slots(1, offset)?;
                frame.push(VType::Object(descriptor.to_string()));
            }
            ANEWARRAY => {
                let element = self.class_operand(instruction)?;
                frame.pop_slots(1, offset)?;
                let array = if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                };
                frame.push(VType::Object(array));
            }
            ARRAYLENGTH | INSTANCEOF => {
                frame.pop_slots(1, offset)?;
                frame.push(VType::Integer);
            }
            CHECKCAST => {
                let class = self.class_operand(instruction)?;
                frame.pop_slots(1, offset)?;
                frame.push(VType::Object(class));
            }
            MULTIANEWARRAY => {
                let Operands::MultiANewArray { dimensions, .. } = instruction.operands else {
                    return Err(invalid(offset, "multianewarray without dimensions"));
                };
                let class = self.class_operand(instruction)?;
                frame.pop_slots(usize::from(dimensions), offset)?;
                frame.push(VType::Object(class));
            }
            other => {
                return Err(invalid(offset, format!("unhandled opcode 0x{other:02X}")));
            }
        }
        Ok(())
    }

    fn member_type(&self, instruction: &Instruction) -> Result<FieldType, RepairError> {
        let offset = instruction.offset;
        let member = instruction
            .symbol()
            .and_then(|index| self.symbols.member_ref(index).ok().flatten())
            .ok_or_else(|| invalid(offset, "field access without field reference"))?;
        FieldType::parse(&member.descriptor).map_err(|error| invalid(offset, error.to_string()))
    }

    fn invoke(&self, instruction: &Instruction, frame: &mut Frame) -> Result<(), RepairError> {
        let offset = instruction.offset;
        let opcode = instruction.opcode;
        let index = instruction
            .symbol()
            .ok_or_else(|| invalid(offset, "invoke without method reference"))?;

        let (name, descriptor) = if opcode == INVOKEDYNAMIC {
            let Some(Symbol::InvokeDynamic { name_and_type, .. }) = self.symbols.get(index) else {
                return Err(invalid(offset, "invokedynamic without call site"));
            };
            let (name, descriptor) = self
                .symbols
                .name_and_type(*name_and_type)
                .map_err(|error| invalid(offset, error.to_string()))?;
            (name.into_owned(), descriptor.into_owned())
        } else {
            let member = self
                .symbols
                .member_ref(index)
                .ok()
                .flatten()
                .ok_or_else(|| invalid(offset, "invoke without method reference"))?;
            (member.name.into_owned(), member.descriptor.into_owned())
        };
        let method =
            MethodDescriptor::parse(&descriptor).map_err(|error| invalid(offset, error.to_string()))?;

        frame.pop_slots(usize::from(method.argument_slots()), offset)?;
        if opcode != INVOKESTATIC && opcode != INVOKEDYNAMIC {
            let receiver = frame.pop_slot(offset)?;
            if opcode == INVOKESPECIAL && name == "<init>" {
                let initialized = match &receiver {
                    VType::UninitializedThis => VType::Object(self.method.owner.to_string()),
                    VType::Uninitialized(site) => {
                        let creation = self
                            .index_of
                            .get(site)
                            .map(|position| &self.instructions[*position])
                            .filter(|creation| creation.opcode == NEW)
                            .ok_or_else(|| invalid(offset, "uninitialized value without new"))?;
                        VType::Object(self.class_operand(creation)?)
                    }
                    other => {
                        return Err(invalid(offset, format!("constructor call on {other}")));
                    }
                };
                frame.replace_all(&receiver, &initialized);
            }
        }
        if let Some(returns) = &method.returns {
            frame.push(VType::from_field(returns));
        }
        Ok(())
    }
}

/// `(slots popped, result)` of arithmetic, conversion and comparison instructions.
fn arithmetic(opcode: u8) -> Option<(usize, VType)> {
    Some(match opcode {
        IADD | ISUB | IMUL | IDIV | IREM | ISHL | ISHR | IUSHR | IAND | IOR | IXOR => {
            (2, VType::Integer)
        }
        LADD | LSUB | LMUL | LDIV | LREM | LAND | LOR | LXOR => (4, VType::Long),
        LSHL | LSHR | LUSHR => (3, VType::Long),
        FADD | FSUB | FMUL | FDIV | FREM => (2, VType::Float),
        DADD | DSUB | DMUL | DDIV | DREM => (4, VType::Double),
        INEG | F2I | I2B | I2C | I2S => (1, VType::Integer),
        LNEG | D2L => (2, VType::Long),
        FNEG | I2F => (1, VType::Float),
        DNEG | L2D => (2, VType::Double),
        I2L | F2L => (1, VType::Long),
        I2D | F2D => (1, VType::Double),
        L2I | D2I => (2, VType::Integer),
        L2F | D2F => (2, VType::Float),
        LCMP | DCMPL | DCMPG => (4, VType::Integer),
        FCMPL | FCMPG => (2, VType::Integer),
        _ => return None,
    })
}

fn write_vtype(value: &VType, symbols: &mut SymbolTable, out: &mut Vec<u8>) -> crate::Result<()> {
    match value {
        VType::Top => out.put_be(0_u8),
        VType::Integer => out.put_be(1_u8),
        VType::Float => out.put_be(2_u8),
        VType::Double => out.put_be(3_u8),
        VType::Long => out.put_be(4_u8),
        VType::Null => out.put_be(5_u8),
        VType::UninitializedThis => out.put_be(6_u8),
        VType::Object(name) => {
            out.put_be(7_u8);
            out.put_be(symbols.add_class(name)?);
        }
        VType::Uninitialized(offset) => {
            out.put_be(8_u8);
            out.put_be(u16::try_from(*offset).map_err(|_| out_of_bounds_error!())?);
        }
    }
    Ok(())
}

/// Collapses slot form to stack-map entries, dropping the `Top` that follows a wide value.
fn collapse(slots: &[VType]) -> Vec<&VType> {
    let mut entries = Vec::with_capacity(slots.len());
    let mut index = 0;
    while index < slots.len() {
        let value = &slots[index];
        entries.push(value);
        index += if value.is_wide() { 2 } else { 1 };
    }
    entries
}

/// Encodes `frames` (offset, frame) as the payload of a `StackMapTable` using full frames.
///
/// # Errors
/// Returns [`crate::Error::SymbolTableFull`] if a class symbol cannot be added.
pub fn encode_stack_map(
    frames: &[(u32, Frame)],
    symbols: &mut SymbolTable,
) -> crate::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.put_be(u16::try_from(frames.len()).map_err(|_| out_of_bounds_error!())?);

    let mut previous: Option<u32> = None;
    for (offset, frame) in frames {
        let delta = match previous {
            None => *offset,
            Some(previous) => offset
                .checked_sub(previous + 1)
                .ok_or_else(|| malformed_error!("Stack map frames out of order at {}", offset))?,
        };
        previous = Some(*offset);

        let mut locals = collapse(&frame.locals);
        while locals.last().is_some_and(|value| **value == VType::Top) {
            locals.pop();
        }
        let stack = collapse(&frame.stack);

        out.put_be(255_u8);
        out.put_be(u16::try_from(delta).map_err(|_| out_of_bounds_error!())?);
        out.put_be(u16::try_from(locals.len()).map_err(|_| out_of_bounds_error!())?);
        for value in locals {
            write_vtype(value, symbols, &mut out)?;
        }
        out.put_be(u16::try_from(stack.len()).map_err(|_| out_of_bounds_error!())?);
        for value in stack {
            write_vtype(value, symbols, &mut out)?;
        }
    }
    Ok(out)
}
