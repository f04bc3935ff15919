//! In-memory model of a compiled unit.
//!
//! A [`CompiledUnit`] is produced fresh from the newest binary blob on every pipeline
//! invocation, mutated during that single rewriting pass and serialized again. Nothing is
//! cached across invocations.
//!
//! # Key Components
//!
//! - [`crate::classfile::CompiledUnit`] - Parsed class file with its members and methods
//! - [`crate::classfile::constants::SymbolTable`] - Append-only constant pool
//! - [`crate::classfile::code::CodeAttribute`] - Method bodies
//! - [`crate::classfile::descriptor`] - Field and method descriptor parsing
//! - [`crate::classfile::builder::UnitBuilder`] - Programmatic construction of units
//!
//! Every structure that the engine does not rewrite is kept in raw form, so a unit that was
//! parsed and not modified serializes to exactly its input bytes.

use std::{borrow::Cow, fmt};

use bitflags::bitflags;

use crate::{
    classfile::{
        code::{CodeAttribute, RawAttribute},
        constants::SymbolTable,
    },
    file::{io::ByteSink, parser::Parser},
    Error, Result,
};

pub mod builder;
pub mod code;
pub mod constants;
pub mod descriptor;

/// The class-file magic number.
pub const MAGIC: u32 = 0xCAFE_BABE;
/// Oldest supported major version (JDK 1.1).
pub const MIN_MAJOR_VERSION: u16 = 45;
/// Newest supported major version.
pub const MAX_MAJOR_VERSION: u16 = 69;
/// First major version that requires `StackMapTable` frames.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

/// Identity of the loader that owns a unit.
///
/// The host assigns these; the engine only compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LoaderId(pub u64);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

/// Identity of a compiled unit: its internal name plus the owning loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    /// Internal name (`com/example/Foo`)
    pub name: String,
    /// Owning loader
    pub loader: LoaderId,
}

impl UnitId {
    /// Creates an identity, normalising a dotted name to internal form.
    #[must_use]
    pub fn new(name: &str, loader: LoaderId) -> Self {
        UnitId {
            name: internal_name(name),
            loader,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.loader)
    }
}

/// Converts `com.example.Foo` to `com/example/Foo`; internal names pass through.
#[must_use]
pub fn internal_name(name: &str) -> String {
    name.replace('.', "/")
}

bitflags! {
    /// Access flags of a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassAccess: u16 {
        /// `ACC_PUBLIC`
        const PUBLIC = 0x0001;
        /// `ACC_FINAL`
        const FINAL = 0x0010;
        /// `ACC_SUPER`
        const SUPER = 0x0020;
        /// `ACC_INTERFACE`
        const INTERFACE = 0x0200;
        /// `ACC_ABSTRACT`
        const ABSTRACT = 0x0400;
        /// `ACC_SYNTHETIC`
        const SYNTHETIC = 0x1000;
        /// `ACC_ANNOTATION`
        const ANNOTATION = 0x2000;
        /// `ACC_ENUM`
        const ENUM = 0x4000;
        /// `ACC_MODULE`
        const MODULE = 0x8000;
    }

    /// Access flags of a field or method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemberAccess: u16 {
        /// `ACC_PUBLIC`
        const PUBLIC = 0x0001;
        /// `ACC_PRIVATE`
        const PRIVATE = 0x0002;
        /// `ACC_PROTECTED`
        const PROTECTED = 0x0004;
        /// `ACC_STATIC`
        const STATIC = 0x0008;
        /// `ACC_FINAL`
        const FINAL = 0x0010;
        /// `ACC_SYNCHRONIZED` (methods) or `ACC_SUPER`
        const SYNCHRONIZED = 0x0020;
        /// `ACC_VOLATILE` (fields) or `ACC_BRIDGE` (methods)
        const VOLATILE = 0x0040;
        /// `ACC_TRANSIENT` (fields) or `ACC_VARARGS` (methods)
        const TRANSIENT = 0x0080;
        /// `ACC_NATIVE`
        const NATIVE = 0x0100;
        /// `ACC_ABSTRACT`
        const ABSTRACT = 0x0400;
        /// `ACC_STRICT`
        const STRICT = 0x0800;
        /// `ACC_SYNTHETIC`
        const SYNTHETIC = 0x1000;
        /// `ACC_ENUM`
        const ENUM = 0x4000;
    }
}

/// A field declared by the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Access flags (unknown bits are retained)
    pub access: MemberAccess,
    /// Symbol index of the name
    pub name_index: u16,
    /// Symbol index of the descriptor
    pub descriptor_index: u16,
    /// Attributes, kept raw
    pub attributes: Vec<RawAttribute>,
}

impl Member {
    fn read(parser: &mut Parser) -> Result<Member> {
        Ok(Member {
            access: MemberAccess::from_bits_retain(parser.read_be()?),
            name_index: parser.read_be()?,
            descriptor_index: parser.read_be()?,
            attributes: RawAttribute::read_list(parser)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.put_be(self.access.bits());
        out.put_be(self.name_index);
        out.put_be(self.descriptor_index);
        RawAttribute::write_list(&self.attributes, out)
    }

    /// Field name.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the name index is invalid.
    pub fn name<'a>(&self, symbols: &'a SymbolTable) -> Result<Cow<'a, str>> {
        symbols.utf8(self.name_index)
    }

    /// Field descriptor.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the descriptor index is invalid.
    pub fn descriptor<'a>(&self, symbols: &'a SymbolTable) -> Result<Cow<'a, str>> {
        symbols.utf8(self.descriptor_index)
    }
}

/// A method attribute: either a parsed `Code` attribute or a raw one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// The method body
    Code {
        /// Symbol index of the `Code` name
        name_index: u16,
        /// The parsed body
        code: CodeAttribute,
    },
    /// Any other attribute
    Raw(RawAttribute),
}

/// A method declared by the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Access flags (unknown bits are retained)
    pub access: MemberAccess,
    /// Symbol index of the name
    pub name_index: u16,
    /// Symbol index of the descriptor
    pub descriptor_index: u16,
    /// Attributes; at most one of them is [`Attribute::Code`]
    pub attributes: Vec<Attribute>,
}

impl Method {
    fn read(parser: &mut Parser, symbols: &SymbolTable) -> Result<Method> {
        let access = MemberAccess::from_bits_retain(parser.read_be()?);
        let name_index = parser.read_be()?;
        let descriptor_index = parser.read_be()?;

        let count = parser.read_be::<u16>()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = RawAttribute::read(parser)?;
            if raw.is_named(symbols, "Code") {
                attributes.push(Attribute::Code {
                    name_index: raw.name_index,
                    code: CodeAttribute::parse(&raw.data)?,
                });
            } else {
                attributes.push(Attribute::Raw(raw));
            }
        }

        Ok(Method {
            access,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    fn write(&self, symbols: &SymbolTable, out: &mut Vec<u8>) -> Result<()> {
        out.put_be(self.access.bits());
        out.put_be(self.name_index);
        out.put_be(self.descriptor_index);
        out.put_be(u16::try_from(self.attributes.len()).map_err(|_| out_of_bounds_error!())?);
        for attribute in &self.attributes {
            match attribute {
                Attribute::Code { name_index, code } => {
                    let data = code.to_bytes().map_err(|error| match error {
                        Error::CodeTooLarge { size, .. } => Error::CodeTooLarge {
                            method: self.display_name(symbols),
                            size,
                        },
                        other => other,
                    })?;
                    RawAttribute {
                        name_index: *name_index,
                        data,
                    }
                    .write(out)?;
                }
                Attribute::Raw(raw) => raw.write(out)?,
            }
        }
        Ok(())
    }

    /// Method name.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the name index is invalid.
    pub fn name<'a>(&self, symbols: &'a SymbolTable) -> Result<Cow<'a, str>> {
        symbols.utf8(self.name_index)
    }

    /// Method descriptor.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the descriptor index is invalid.
    pub fn descriptor<'a>(&self, symbols: &'a SymbolTable) -> Result<Cow<'a, str>> {
        symbols.utf8(self.descriptor_index)
    }

    /// `name` followed by the descriptor, for diagnostics.
    #[must_use]
    pub fn display_name(&self, symbols: &SymbolTable) -> String {
        format!(
            "{}{}",
            self.name(symbols).unwrap_or(Cow::Borrowed("?")),
            self.descriptor(symbols).unwrap_or(Cow::Borrowed("?"))
        )
    }

    /// Returns `true` if the method is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access.contains(MemberAccess::STATIC)
    }

    /// The method body, if it has one.
    #[must_use]
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::Code { code, .. } => Some(code),
            Attribute::Raw(_) => None,
        })
    }

    /// Mutable access to the method body, if it has one.
    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|attribute| match attribute {
            Attribute::Code { code, .. } => Some(code),
            Attribute::Raw(_) => None,
        })
    }
}

/// A parsed compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Minor version
    pub minor_version: u16,
    /// Major version
    pub major_version: u16,
    /// The constant pool
    pub symbols: SymbolTable,
    /// Class access flags (unknown bits are retained)
    pub access: ClassAccess,
    /// Symbol index of this class
    pub this_class: u16,
    /// Symbol index of the superclass, 0 for `java/lang/Object` itself
    pub super_class: u16,
    /// Symbol indices of implemented interfaces
    pub interfaces: Vec<u16>,
    /// Declared fields
    pub fields: Vec<Member>,
    /// Declared methods
    pub methods: Vec<Method>,
    /// Class-level attributes, kept raw
    pub attributes: Vec<RawAttribute>,
}

impl CompiledUnit {
    /// Parses a class file.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for empty input, [`crate::Error::Malformed`] for a
    /// bad magic number or structure, [`crate::Error::UnsupportedVersion`] for a major
    /// version outside the supported range and [`crate::Error::OutOfBounds`] for truncated
    /// input.
    pub fn parse(data: &[u8]) -> Result<CompiledUnit> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let mut parser = Parser::new(data);
        let magic = parser.read_be::<u32>()?;
        if magic != MAGIC {
            return Err(malformed_error!("Invalid magic 0x{:08X}", magic));
        }

        let minor_version = parser.read_be::<u16>()?;
        let major_version = parser.read_be::<u16>()?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(Error::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let symbols = SymbolTable::read(&mut parser)?;
        let access = ClassAccess::from_bits_retain(parser.read_be()?);
        let this_class = parser.read_be()?;
        let super_class = parser.read_be()?;

        let interface_count = parser.read_be::<u16>()?;
        let interfaces = (0..interface_count)
            .map(|_| parser.read_be::<u16>())
            .collect::<Result<Vec<_>>>()?;

        let field_count = parser.read_be::<u16>()?;
        let fields = (0..field_count)
            .map(|_| Member::read(&mut parser))
            .collect::<Result<Vec<_>>>()?;

        let method_count = parser.read_be::<u16>()?;
        let methods = (0..method_count)
            .map(|_| Method::read(&mut parser, &symbols))
            .collect::<Result<Vec<_>>>()?;

        let attributes = RawAttribute::read_list(&mut parser)?;
        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes after class attributes",
                parser.remaining()
            ));
        }

        let unit = CompiledUnit {
            minor_version,
            major_version,
            symbols,
            access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        unit.name()?;
        Ok(unit)
    }

    /// Serializes the unit back to class-file bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::CodeTooLarge`] if a method body exceeds the format limit.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(4096);
        out.put_be(MAGIC);
        out.put_be(self.minor_version);
        out.put_be(self.major_version);
        self.symbols.write(&mut out);
        out.put_be(self.access.bits());
        out.put_be(self.this_class);
        out.put_be(self.super_class);

        out.put_be(u16::try_from(self.interfaces.len()).map_err(|_| out_of_bounds_error!())?);
        for interface in &self.interfaces {
            out.put_be(*interface);
        }

        out.put_be(u16::try_from(self.fields.len()).map_err(|_| out_of_bounds_error!())?);
        for field in &self.fields {
            field.write(&mut out)?;
        }

        out.put_be(u16::try_from(self.methods.len()).map_err(|_| out_of_bounds_error!())?);
        for method in &self.methods {
            method.write(&self.symbols, &mut out)?;
        }

        RawAttribute::write_list(&self.attributes, &mut out)?;
        Ok(out)
    }

    /// Internal name of this unit.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `this_class` is not a valid class symbol.
    pub fn name(&self) -> Result<Cow<'_, str>> {
        self.symbols.class_name(self.this_class)
    }

    /// Internal name of the superclass, `None` for the root class.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `super_class` is not a valid class symbol.
    pub fn super_name(&self) -> Result<Option<Cow<'_, str>>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.symbols.class_name(self.super_class).map(Some)
    }

    /// Returns `true` if the unit is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccess::INTERFACE)
    }

    /// Returns `true` if the unit declares a field called `name` with `descriptor`.
    #[must_use]
    pub fn declares_field(&self, name: &str, descriptor: &str) -> bool {
        self.fields.iter().any(|field| {
            field.name(&self.symbols).is_ok_and(|n| n == name)
                && field.descriptor(&self.symbols).is_ok_and(|d| d == descriptor)
        })
    }

    /// Finds a method by name and descriptor.
    #[must_use]
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods.iter().position(|method| {
            method.name(&self.symbols).is_ok_and(|n| n == name)
                && method.descriptor(&self.symbols).is_ok_and(|d| d == descriptor)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::opcodes::*, classfile::builder::UnitBuilder};

    fn sample() -> Vec<u8> {
        UnitBuilder::new("a/Sample")
            .field(MemberAccess::PRIVATE, "count", "I")
            .method(MemberAccess::PUBLIC, "get", "()I", |code| {
                code.op(ALOAD_0)?;
                code.field(GETFIELD, "a/Sample", "count", "I")?;
                code.op(IRETURN)
            })
            .build()
            .unwrap()
    }

    #[test]
    fn unmodified_unit_round_trips_byte_exact() {
        let bytes = sample();
        let unit = CompiledUnit::parse(&bytes).unwrap();
        assert_eq!(unit.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn exposes_names_and_members() {
        let unit = CompiledUnit::parse(&sample()).unwrap();
        assert_eq!(unit.name().unwrap(), "a/Sample");
        assert_eq!(unit.super_name().unwrap().as_deref(), Some("java/lang/Object"));
        assert!(unit.declares_field("count", "I"));
        assert!(!unit.declares_field("count", "J"));

        let index = unit.find_method("get", "()I").unwrap();
        let method = &unit.methods[index];
        assert!(!method.is_static());
        assert_eq!(method.code().unwrap().code.len(), 5);
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(CompiledUnit::parse(&[]), Err(Error::Empty)));
        assert!(matches!(
            CompiledUnit::parse(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 52]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            CompiledUnit::parse(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 99]),
            Err(Error::UnsupportedVersion { major: 99, .. })
        ));

        let mut truncated = sample();
        truncated.truncate(truncated.len() - 3);
        assert!(CompiledUnit::parse(&truncated).is_err());
    }

    #[test]
    fn unit_id_normalises_dotted_names() {
        let id = UnitId::new("com.example.Foo", LoaderId(3));
        assert_eq!(id.name, "com/example/Foo");
        assert_eq!(id.to_string(), "com/example/Foo@loader#3");
    }
}
