//! Programmatic construction of compiled units.
//!
//! [`UnitBuilder`] produces class-file bytes from a short description: name, superclass,
//! fields and methods whose bodies are written with a [`PatchEncoder`]. Hosts use it to
//! synthesize small helper units; the crate's own tests use it to build inputs without a
//! compiler.
//!
//! # Examples
//!
//! ```rust
//! use hotswap::assembly::opcodes::*;
//! use hotswap::classfile::{builder::UnitBuilder, CompiledUnit, MemberAccess};
//!
//! let bytes = UnitBuilder::new("demo/Counter")
//!     .field(MemberAccess::PRIVATE, "count", "I")
//!     .method(MemberAccess::PUBLIC, "count", "()I", |code| {
//!         code.op(ALOAD_0)?;
//!         code.field(GETFIELD, "demo/Counter", "count", "I")?;
//!         code.op(IRETURN)
//!     })
//!     .build()?;
//!
//! let unit = CompiledUnit::parse(&bytes)?;
//! assert_eq!(unit.name()?, "demo/Counter");
//! # Ok::<(), hotswap::Error>(())
//! ```

use crate::{
    assembly::{
        encoder::PatchEncoder,
        instruction::{decode_all, Operands},
        opcodes::*,
    },
    classfile::{
        code::{CodeAttribute, ExceptionEntry},
        constants::SymbolTable,
        descriptor::MethodDescriptor,
        Attribute, ClassAccess, CompiledUnit, Member, MemberAccess, Method,
    },
    Result,
};

type Body = Box<dyn FnOnce(&mut PatchEncoder<'_>) -> Result<()>>;

struct CatchSpec {
    start: String,
    end: String,
    handler: String,
    catch_type: Option<String>,
}

struct MethodSpec {
    access: MemberAccess,
    name: String,
    descriptor: String,
    body: Option<Body>,
    catches: Vec<CatchSpec>,
}

/// Builder for class-file bytes.
pub struct UnitBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access: ClassAccess,
    major_version: u16,
    fields: Vec<(MemberAccess, String, String)>,
    methods: Vec<MethodSpec>,
}

impl UnitBuilder {
    /// Starts a public class called `name` extending `java/lang/Object`, version 52.
    #[must_use]
    pub fn new(name: &str) -> Self {
        UnitBuilder {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access: ClassAccess::PUBLIC | ClassAccess::SUPER,
            major_version: 52,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Sets the superclass; `None` only makes sense for `java/lang/Object`.
    #[must_use]
    pub fn super_class(mut self, name: Option<&str>) -> Self {
        self.super_name = name.map(str::to_string);
        self
    }

    /// Adds an implemented interface.
    #[must_use]
    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    /// Replaces the class access flags.
    #[must_use]
    pub fn access(mut self, access: ClassAccess) -> Self {
        self.access = access;
        self
    }

    /// Sets the major class-file version.
    #[must_use]
    pub fn version(mut self, major: u16) -> Self {
        self.major_version = major;
        self
    }

    /// Declares a field.
    #[must_use]
    pub fn field(mut self, access: MemberAccess, name: &str, descriptor: &str) -> Self {
        self.fields
            .push((access, name.to_string(), descriptor.to_string()));
        self
    }

    /// Declares a method whose body is emitted by `body`.
    ///
    /// `max_stack` is taken from the encoder and `max_locals` from the highest local
    /// touched or the argument slots, whichever is larger.
    #[must_use]
    pub fn method(
        mut self,
        access: MemberAccess,
        name: &str,
        descriptor: &str,
        body: impl FnOnce(&mut PatchEncoder<'_>) -> Result<()> + 'static,
    ) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            body: Some(Box::new(body)),
            catches: Vec::new(),
        });
        self
    }

    /// Declares a method without a body (abstract or native).
    #[must_use]
    pub fn bodiless_method(mut self, access: MemberAccess, name: &str, descriptor: &str) -> Self {
        self.methods.push(MethodSpec {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            body: None,
            catches: Vec::new(),
        });
        self
    }

    /// Adds an exception handler, given as labels, to the most recently declared method.
    #[must_use]
    pub fn catch(mut self, start: &str, end: &str, handler: &str, catch_type: Option<&str>) -> Self {
        if let Some(method) = self.methods.last_mut() {
            method.catches.push(CatchSpec {
                start: start.to_string(),
                end: end.to_string(),
                handler: handler.to_string(),
                catch_type: catch_type.map(str::to_string),
            });
        }
        self
    }

    /// Produces the class-file bytes.
    ///
    /// # Errors
    /// Returns the first error raised by a method body, an unbound handler label or a
    /// malformed descriptor.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut symbols = SymbolTable::new();
        let this_class = symbols.add_class(&self.name)?;
        let super_class = match &self.super_name {
            Some(name) => symbols.add_class(name)?,
            None => 0,
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|name| symbols.add_class(name))
            .collect::<Result<Vec<_>>>()?;

        let mut fields = Vec::with_capacity(self.fields.len());
        for (access, name, descriptor) in &self.fields {
            fields.push(Member {
                access: *access,
                name_index: symbols.add_utf8(name)?,
                descriptor_index: symbols.add_utf8(descriptor)?,
                attributes: Vec::new(),
            });
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for spec in self.methods {
            let name_index = symbols.add_utf8(&spec.name)?;
            let descriptor_index = symbols.add_utf8(&spec.descriptor)?;
            let mut attributes = Vec::new();

            if let Some(body) = spec.body {
                let arguments = MethodDescriptor::parse(&spec.descriptor)?.argument_slots()
                    + u16::from(!spec.access.contains(MemberAccess::STATIC));

                let mut encoder = PatchEncoder::new(&mut symbols);
                body(&mut encoder)?;
                let offsets = spec
                    .catches
                    .iter()
                    .map(|catch| {
                        let label = |name: &str| {
                            encoder
                                .label_offset(name)
                                .and_then(|offset| u16::try_from(offset).ok())
                                .ok_or_else(|| malformed_error!("Unbound handler label '{}'", name))
                        };
                        Ok((label(&catch.start)?, label(&catch.end)?, label(&catch.handler)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let patch = encoder.finish()?;

                let mut exception_table = Vec::with_capacity(offsets.len());
                for ((start_pc, end_pc, handler_pc), catch) in offsets.into_iter().zip(&spec.catches) {
                    let catch_type = match &catch.catch_type {
                        Some(name) => symbols.add_class(name)?,
                        None => 0,
                    };
                    exception_table.push(ExceptionEntry {
                        start_pc,
                        end_pc,
                        handler_pc,
                        catch_type,
                    });
                }

                let code = CodeAttribute {
                    max_stack: u16::try_from(patch.max_depth.max(0)).map_err(|_| out_of_bounds_error!())?,
                    max_locals: arguments.max(highest_local(&patch.code)?),
                    code: patch.code,
                    exception_table,
                    attributes: Vec::new(),
                };
                attributes.push(Attribute::Code {
                    name_index: symbols.add_utf8("Code")?,
                    code,
                });
            }

            methods.push(Method {
                access: spec.access,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        CompiledUnit {
            minor_version: 0,
            major_version: self.major_version,
            symbols,
            access: self.access,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes: Vec::new(),
        }
        .to_bytes()
    }
}

/// One past the highest local-variable slot the code touches.
fn highest_local(code: &[u8]) -> Result<u16> {
    let mut highest = 0;
    for instruction in decode_all(code)? {
        let touched = match (instruction.opcode, &instruction.operands) {
            (ILOAD_0..=ALOAD_3, _) => {
                let relative = instruction.opcode - ILOAD_0;
                u16::from(relative % 4) + wide_slots(relative / 4)
            }
            (ISTORE_0..=ASTORE_3, _) => {
                let relative = instruction.opcode - ISTORE_0;
                u16::from(relative % 4) + wide_slots(relative / 4)
            }
            (LLOAD | DLOAD | LSTORE | DSTORE, Operands::Local(index)) => index + 2,
            (_, Operands::Local(index)) | (_, Operands::Iinc { local: index, .. }) => index + 1,
            _ => 0,
        };
        highest = highest.max(touched);
    }
    Ok(highest)
}

/// Slots of the `kind`-th type in the `I, L, F, D, A` load/store grouping.
fn wide_slots(kind: u8) -> u16 {
    if kind == 1 || kind == 3 {
        2
    } else {
        1
    }
}
