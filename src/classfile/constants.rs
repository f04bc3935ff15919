//! The symbol table (constant pool) of a compiled unit.
//!
//! Indices are 1-based. `Long` and `Double` constants occupy two slots; the second one is
//! held by [`Symbol::Reserved`] so positional indexing stays identical to the binary form.
//!
//! The table is append-only: the `add_*` helpers either return the index of an identical
//! entry that already exists or push a new entry at the end. Nothing is ever removed or
//! renumbered, so an index captured before a rewrite resolves to the same symbol after it.

use std::{borrow::Cow, collections::HashMap};

use strum::{Display, IntoStaticStr};

use crate::{
    file::{io::ByteSink, parser::Parser},
    Error, Result,
};

/// Largest number of slots a symbol table may hold (slot 0 included).
pub const MAX_SYMBOL_SLOTS: usize = 0xFFFF;

/// One entry of the symbol table.
///
/// Floating point constants are kept as raw bits so entries can be hashed and compared
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum Symbol {
    /// Placeholder for slot 0 and for the second slot of a `Long`/`Double`
    Reserved,
    /// Modified UTF-8 text, stored as the raw encoded bytes
    Utf8(Vec<u8>),
    /// 32-bit integer literal
    Integer(i32),
    /// 32-bit float literal (raw bits)
    Float(u32),
    /// 64-bit integer literal
    Long(i64),
    /// 64-bit float literal (raw bits)
    Double(u64),
    /// Reference to a class or array type
    Class {
        /// Index of the internal name
        name: u16,
    },
    /// String literal
    String {
        /// Index of the text
        value: u16,
    },
    /// Field reference
    Fieldref {
        /// Index of the owning class
        class: u16,
        /// Index of the name-and-type pair
        name_and_type: u16,
    },
    /// Method reference on a class
    Methodref {
        /// Index of the owning class
        class: u16,
        /// Index of the name-and-type pair
        name_and_type: u16,
    },
    /// Method reference on an interface
    InterfaceMethodref {
        /// Index of the owning interface
        class: u16,
        /// Index of the name-and-type pair
        name_and_type: u16,
    },
    /// Name and descriptor pair
    NameAndType {
        /// Index of the member name
        name: u16,
        /// Index of the descriptor
        descriptor: u16,
    },
    /// Method handle
    MethodHandle {
        /// Reference kind (1..=9)
        kind: u8,
        /// Index of the referenced member
        reference: u16,
    },
    /// Method type
    MethodType {
        /// Index of the method descriptor
        descriptor: u16,
    },
    /// Dynamically computed constant
    Dynamic {
        /// Index into the bootstrap method table
        bootstrap: u16,
        /// Index of the name-and-type pair
        name_and_type: u16,
    },
    /// Dynamically computed call site
    InvokeDynamic {
        /// Index into the bootstrap method table
        bootstrap: u16,
        /// Index of the name-and-type pair
        name_and_type: u16,
    },
    /// Module name
    Module {
        /// Index of the name
        name: u16,
    },
    /// Package name
    Package {
        /// Index of the name
        name: u16,
    },
}

impl Symbol {
    /// Binary tag of this entry kind.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Symbol::Reserved => 0,
            Symbol::Utf8(_) => 1,
            Symbol::Integer(_) => 3,
            Symbol::Float(_) => 4,
            Symbol::Long(_) => 5,
            Symbol::Double(_) => 6,
            Symbol::Class { .. } => 7,
            Symbol::String { .. } => 8,
            Symbol::Fieldref { .. } => 9,
            Symbol::Methodref { .. } => 10,
            Symbol::InterfaceMethodref { .. } => 11,
            Symbol::NameAndType { .. } => 12,
            Symbol::MethodHandle { .. } => 15,
            Symbol::MethodType { .. } => 16,
            Symbol::Dynamic { .. } => 17,
            Symbol::InvokeDynamic { .. } => 18,
            Symbol::Module { .. } => 19,
            Symbol::Package { .. } => 20,
        }
    }

    /// Returns `true` for the two-slot constants.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, Symbol::Long(_) | Symbol::Double(_))
    }

    fn read(parser: &mut Parser) -> Result<Symbol> {
        let tag = parser.read_be::<u8>()?;
        Ok(match tag {
            1 => {
                let len = parser.read_be::<u16>()?;
                Symbol::Utf8(parser.read_bytes(len as usize)?.to_vec())
            }
            3 => Symbol::Integer(parser.read_be()?),
            4 => Symbol::Float(parser.read_be()?),
            5 => Symbol::Long(parser.read_be()?),
            6 => Symbol::Double(parser.read_be()?),
            7 => Symbol::Class {
                name: parser.read_be()?,
            },
            8 => Symbol::String {
                value: parser.read_be()?,
            },
            9 => Symbol::Fieldref {
                class: parser.read_be()?,
                name_and_type: parser.read_be()?,
            },
            10 => Symbol::Methodref {
                class: parser.read_be()?,
                name_and_type: parser.read_be()?,
            },
            11 => Symbol::InterfaceMethodref {
                class: parser.read_be()?,
                name_and_type: parser.read_be()?,
            },
            12 => Symbol::NameAndType {
                name: parser.read_be()?,
                descriptor: parser.read_be()?,
            },
            15 => Symbol::MethodHandle {
                kind: parser.read_be()?,
                reference: parser.read_be()?,
            },
            16 => Symbol::MethodType {
                descriptor: parser.read_be()?,
            },
            17 => Symbol::Dynamic {
                bootstrap: parser.read_be()?,
                name_and_type: parser.read_be()?,
            },
            18 => Symbol::InvokeDynamic {
                bootstrap: parser.read_be()?,
                name_and_type: parser.read_be()?,
            },
            19 => Symbol::Module {
                name: parser.read_be()?,
            },
            20 => Symbol::Package {
                name: parser.read_be()?,
            },
            other => {
                return Err(malformed_error!(
                    "Unknown symbol tag {} at offset {}",
                    other,
                    parser.pos() - 1
                ))
            }
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        if matches!(self, Symbol::Reserved) {
            return;
        }

        out.put_be(self.tag());
        match self {
            Symbol::Reserved => {}
            Symbol::Utf8(bytes) => {
                // length was validated on insertion
                #[allow(clippy::cast_possible_truncation)]
                out.put_be(bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            Symbol::Integer(value) => out.put_be(*value),
            Symbol::Float(bits) => out.put_be(*bits),
            Symbol::Long(value) => out.put_be(*value),
            Symbol::Double(bits) => out.put_be(*bits),
            Symbol::Class { name } | Symbol::Module { name } | Symbol::Package { name } => {
                out.put_be(*name);
            }
            Symbol::String { value } => out.put_be(*value),
            Symbol::MethodType { descriptor } => out.put_be(*descriptor),
            Symbol::Fieldref {
                class,
                name_and_type,
            }
            | Symbol::Methodref {
                class,
                name_and_type,
            }
            | Symbol::InterfaceMethodref {
                class,
                name_and_type,
            } => {
                out.put_be(*class);
                out.put_be(*name_and_type);
            }
            Symbol::NameAndType { name, descriptor } => {
                out.put_be(*name);
                out.put_be(*descriptor);
            }
            Symbol::MethodHandle { kind, reference } => {
                out.put_be(*kind);
                out.put_be(*reference);
            }
            Symbol::Dynamic {
                bootstrap,
                name_and_type,
            }
            | Symbol::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                out.put_be(*bootstrap);
                out.put_be(*name_and_type);
            }
        }
    }
}

/// Which kind of member a resolved reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MemberKind {
    /// `Fieldref`
    Field,
    /// `Methodref`
    Method,
    /// `InterfaceMethodref`
    InterfaceMethod,
}

/// A field or method reference with every index resolved to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef<'a> {
    /// Reference kind
    pub kind: MemberKind,
    /// Internal name of the owning type (`java/lang/String`)
    pub owner: Cow<'a, str>,
    /// Member name
    pub name: Cow<'a, str>,
    /// Field or method descriptor
    pub descriptor: Cow<'a, str>,
}

impl MemberRef<'_> {
    /// Detaches the reference from the table it was resolved against.
    #[must_use]
    pub fn into_owned(self) -> MemberRef<'static> {
        MemberRef {
            kind: self.kind,
            owner: Cow::Owned(self.owner.into_owned()),
            name: Cow::Owned(self.name.into_owned()),
            descriptor: Cow::Owned(self.descriptor.into_owned()),
        }
    }
}

/// The ordered, append-only symbol table of a compiled unit.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    entries: Vec<Symbol>,
    lookup: HashMap<Symbol, u16>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SymbolTable {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for SymbolTable {}

impl SymbolTable {
    /// Creates an empty table holding only the reserved slot 0.
    #[must_use]
    pub fn new() -> Self {
        SymbolTable {
            entries: vec![Symbol::Reserved],
            lookup: HashMap::new(),
        }
    }

    /// Parses a table from its binary form (the count followed by the entries).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown tags or a long/double in the last
    /// slot, and [`crate::Error::OutOfBounds`] for truncated input.
    pub fn read(parser: &mut Parser) -> Result<SymbolTable> {
        let count = parser.read_be::<u16>()? as usize;
        if count == 0 {
            return Err(malformed_error!("Symbol table count must be at least 1"));
        }

        let mut table = SymbolTable {
            entries: Vec::with_capacity(count),
            lookup: HashMap::with_capacity(count),
        };
        table.entries.push(Symbol::Reserved);

        while table.entries.len() < count {
            let symbol = Symbol::read(parser)?;
            let wide = symbol.is_wide();
            table.push_indexed(symbol);
            if wide {
                if table.entries.len() >= count {
                    return Err(malformed_error!("Wide constant occupies the last symbol slot"));
                }
                table.entries.push(Symbol::Reserved);
            }
        }

        Ok(table)
    }

    /// Serializes the table including its leading count.
    pub fn write(&self, out: &mut Vec<u8>) {
        // bounded by MAX_SYMBOL_SLOTS on every insertion
        #[allow(clippy::cast_possible_truncation)]
        out.put_be(self.entries.len() as u16);
        for symbol in &self.entries[1..] {
            symbol.write(out);
        }
    }

    /// Number of slots including the reserved slot 0.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table holds nothing besides the reserved slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Returns the symbol at `index`, if the index is in range.
    #[must_use]
    pub fn get(&self, index: u16) -> Option<&Symbol> {
        self.entries.get(index as usize)
    }

    /// Iterates over `(index, symbol)` for every slot except slot 0.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Symbol)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            // bounded by MAX_SYMBOL_SLOTS
            .map(|(index, symbol)| (index as u16, symbol))
    }

    /// Returns the text of the `Utf8` entry at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the entry is missing or of another kind.
    pub fn utf8(&self, index: u16) -> Result<Cow<'_, str>> {
        match self.get(index) {
            Some(Symbol::Utf8(bytes)) => Ok(String::from_utf8_lossy(bytes)),
            other => Err(malformed_error!(
                "Expected Utf8 at symbol {}, found {:?}",
                index,
                other
            )),
        }
    }

    /// Returns the internal name referenced by the `Class` entry at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the entry is missing or of another kind.
    pub fn class_name(&self, index: u16) -> Result<Cow<'_, str>> {
        match self.get(index) {
            Some(Symbol::Class { name }) => self.utf8(*name),
            other => Err(malformed_error!(
                "Expected Class at symbol {}, found {:?}",
                index,
                other
            )),
        }
    }

    /// Returns `(name, descriptor)` of the `NameAndType` entry at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the entry is missing or of another kind.
    pub fn name_and_type(&self, index: u16) -> Result<(Cow<'_, str>, Cow<'_, str>)> {
        match self.get(index) {
            Some(Symbol::NameAndType { name, descriptor }) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            other => Err(malformed_error!(
                "Expected NameAndType at symbol {}, found {:?}",
                index,
                other
            )),
        }
    }

    /// Resolves the field or method reference at `index`.
    ///
    /// Returns `Ok(None)` when the entry exists but is not a member reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a member reference points at entries of the
    /// wrong kind.
    pub fn member_ref(&self, index: u16) -> Result<Option<MemberRef<'_>>> {
        let (kind, class, name_and_type) = match self.get(index) {
            Some(Symbol::Fieldref {
                class,
                name_and_type,
            }) => (MemberKind::Field, *class, *name_and_type),
            Some(Symbol::Methodref {
                class,
                name_and_type,
            }) => (MemberKind::Method, *class, *name_and_type),
            Some(Symbol::InterfaceMethodref {
                class,
                name_and_type,
            }) => (MemberKind::InterfaceMethod, *class, *name_and_type),
            _ => return Ok(None),
        };

        let owner = self.class_name(class)?;
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(Some(MemberRef {
            kind,
            owner,
            name,
            descriptor,
        }))
    }

    /// Appends `symbol` unless an identical entry exists, returning its index.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a `Utf8` entry longer than 65535 bytes and
    /// [`crate::Error::SymbolTableFull`] if the table has no room left.
    pub fn add(&mut self, symbol: Symbol) -> Result<u16> {
        if let Some(index) = self.lookup.get(&symbol) {
            return Ok(*index);
        }

        if let Symbol::Utf8(bytes) = &symbol {
            if bytes.len() > usize::from(u16::MAX) {
                return Err(malformed_error!("Utf8 constant of {} encoded bytes", bytes.len()));
            }
        }

        let needed = if symbol.is_wide() { 2 } else { 1 };
        if self.entries.len() + needed > MAX_SYMBOL_SLOTS {
            return Err(Error::SymbolTableFull);
        }

        let wide = symbol.is_wide();
        let index = self.push_indexed(symbol);
        if wide {
            self.entries.push(Symbol::Reserved);
        }
        Ok(index)
    }

    /// Adds a `Utf8` entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the modified UTF-8 encoding of the text is
    /// longer than 65535 bytes and [`crate::Error::SymbolTableFull`] if the table has no room
    /// left.
    pub fn add_utf8(&mut self, text: &str) -> Result<u16> {
        self.add(Symbol::Utf8(encode_modified_utf8(text)))
    }

    /// Adds a `Class` entry for an internal name.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_class(&mut self, internal_name: &str) -> Result<u16> {
        let name = self.add_utf8(internal_name)?;
        self.add(Symbol::Class { name })
    }

    /// Adds a `String` literal entry.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_string(&mut self, text: &str) -> Result<u16> {
        let value = self.add_utf8(text)?;
        self.add(Symbol::String { value })
    }

    /// Adds an `Integer` literal entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::SymbolTableFull`] if the table has no room left.
    pub fn add_integer(&mut self, value: i32) -> Result<u16> {
        self.add(Symbol::Integer(value))
    }

    /// Adds a `NameAndType` entry.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.add(Symbol::NameAndType { name, descriptor })
    }

    /// Adds a `Fieldref` entry.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Symbol::Fieldref {
            class,
            name_and_type,
        })
    }

    /// Adds a `Methodref` entry.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Symbol::Methodref {
            class,
            name_and_type,
        })
    }

    /// Adds an `InterfaceMethodref` entry.
    ///
    /// # Errors
    /// See [`SymbolTable::add_utf8`].
    pub fn add_interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class = self.add_class(owner)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Symbol::InterfaceMethodref {
            class,
            name_and_type,
        })
    }

    fn push_indexed(&mut self, symbol: Symbol) -> u16 {
        // callers keep the table below MAX_SYMBOL_SLOTS
        #[allow(clippy::cast_possible_truncation)]
        let index = self.entries.len() as u16;
        self.lookup.entry(symbol.clone()).or_insert(index);
        self.entries.push(symbol);
        index
    }
}

/// Encodes `text` in the modified UTF-8 form used by class files.
///
/// NUL is written as the two-byte sequence `C0 80` and supplementary characters as a
/// surrogate pair of three-byte sequences.
#[must_use]
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match ch as u32 {
            0 => out.extend_from_slice(&[0xC0, 0x80]),
            0x01..=0x7F => out.push(ch as u8),
            0x10000.. => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    encode_unit(*unit, &mut out);
                }
            }
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

/// Number of bytes `ch` takes in modified UTF-8.
#[must_use]
pub fn modified_utf8_width(ch: char) -> usize {
    match ch as u32 {
        0x01..=0x7F => 1,
        0 | 0x80..=0x7FF => 2,
        0x800..=0xFFFF => 3,
        _ => 6,
    }
}

fn encode_unit(unit: u16, out: &mut Vec<u8>) {
    // three-byte form of a single UTF-16 code unit
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&[
        0xE0 | (unit >> 12) as u8,
        0x80 | ((unit >> 6) & 0x3F) as u8,
        0x80 | (unit & 0x3F) as u8,
    ]);
}
