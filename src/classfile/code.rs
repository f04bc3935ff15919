//! The `Code` attribute of a method and raw attribute storage.

use crate::{
    classfile::constants::SymbolTable,
    file::{io::ByteSink, parser::Parser},
    Error, Result,
};

/// Longest code array a method may carry.
pub const MAX_CODE_LENGTH: usize = 0xFFFF;

/// An attribute kept as opaque bytes and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    /// Symbol index of the attribute name
    pub name_index: u16,
    /// Attribute payload, excluding the name and length header
    pub data: Vec<u8>,
}

impl RawAttribute {
    pub(crate) fn read(parser: &mut Parser) -> Result<RawAttribute> {
        let name_index = parser.read_be::<u16>()?;
        let length = parser.read_be::<u32>()? as usize;
        let data = parser.read_bytes(length)?.to_vec();
        Ok(RawAttribute { name_index, data })
    }

    pub(crate) fn read_list(parser: &mut Parser) -> Result<Vec<RawAttribute>> {
        let count = parser.read_be::<u16>()?;
        (0..count).map(|_| RawAttribute::read(parser)).collect()
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.put_be(self.name_index);
        out.put_be(u32::try_from(self.data.len()).map_err(|_| out_of_bounds_error!())?);
        out.extend_from_slice(&self.data);
        Ok(())
    }

    pub(crate) fn write_list(list: &[RawAttribute], out: &mut Vec<u8>) -> Result<()> {
        out.put_be(u16::try_from(list.len()).map_err(|_| out_of_bounds_error!())?);
        for attribute in list {
            attribute.write(out)?;
        }
        Ok(())
    }

    /// Returns `true` if the attribute name is `name`.
    #[must_use]
    pub fn is_named(&self, symbols: &SymbolTable, name: &str) -> bool {
        symbols
            .utf8(self.name_index)
            .is_ok_and(|text| text == name)
    }
}

/// One row of a method's exception table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// First covered offset
    pub start_pc: u16,
    /// First offset past the covered range
    pub end_pc: u16,
    /// Offset of the handler
    pub handler_pc: u16,
    /// Symbol index of the caught class, 0 for any
    pub catch_type: u16,
}

/// A parsed `Code` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    /// Maximum operand-stack depth
    pub max_stack: u16,
    /// Number of local-variable slots
    pub max_locals: u16,
    /// The instruction bytes
    pub code: Vec<u8>,
    /// Exception handler table
    pub exception_table: Vec<ExceptionEntry>,
    /// Nested attributes (`LineNumberTable`, `StackMapTable`, ...)
    pub attributes: Vec<RawAttribute>,
}

impl CodeAttribute {
    /// Parses the payload of a `Code` attribute.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated input and
    /// [`crate::Error::Malformed`] for an empty or oversized code array.
    pub fn parse(data: &[u8]) -> Result<CodeAttribute> {
        let mut parser = Parser::new(data);
        let max_stack = parser.read_be::<u16>()?;
        let max_locals = parser.read_be::<u16>()?;
        let code_length = parser.read_be::<u32>()? as usize;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(malformed_error!("Invalid code length {}", code_length));
        }
        let code = parser.read_bytes(code_length)?.to_vec();

        let handlers = parser.read_be::<u16>()?;
        let mut exception_table = Vec::with_capacity(handlers as usize);
        for _ in 0..handlers {
            exception_table.push(ExceptionEntry {
                start_pc: parser.read_be()?,
                end_pc: parser.read_be()?,
                handler_pc: parser.read_be()?,
                catch_type: parser.read_be()?,
            });
        }

        let attributes = RawAttribute::read_list(&mut parser)?;
        if parser.has_more_data() {
            return Err(malformed_error!(
                "{} trailing bytes in Code attribute",
                parser.remaining()
            ));
        }

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    /// Serializes the attribute payload (without the name and length header).
    ///
    /// # Errors
    /// Returns [`crate::Error::CodeTooLarge`] if the code array exceeds the format limit.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.code.len() > MAX_CODE_LENGTH {
            return Err(Error::CodeTooLarge {
                method: String::new(),
                size: self.code.len(),
            });
        }

        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.put_be(self.max_stack);
        out.put_be(self.max_locals);
        // bounded by MAX_CODE_LENGTH above
        #[allow(clippy::cast_possible_truncation)]
        out.put_be(self.code.len() as u32);
        out.extend_from_slice(&self.code);

        out.put_be(u16::try_from(self.exception_table.len()).map_err(|_| out_of_bounds_error!())?);
        for entry in &self.exception_table {
            out.put_be(entry.start_pc);
            out.put_be(entry.end_pc);
            out.put_be(entry.handler_pc);
            out.put_be(entry.catch_type);
        }

        RawAttribute::write_list(&self.attributes, &mut out)?;
        Ok(out)
    }

    /// Returns the first nested attribute called `name`.
    #[must_use]
    pub fn attribute<'a>(&'a self, symbols: &SymbolTable, name: &str) -> Option<&'a RawAttribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.is_named(symbols, name))
    }

    /// Drops every nested attribute called `name`.
    pub fn remove_attribute(&mut self, symbols: &SymbolTable, name: &str) {
        self.attributes
            .retain(|attribute| !attribute.is_named(symbols, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_attribute_round_trip() {
        let mut symbols = SymbolTable::new();
        let lines = symbols.add_utf8("LineNumberTable").unwrap();

        let code = CodeAttribute {
            max_stack: 2,
            max_locals: 1,
            code: vec![0x03, 0xAC],
            exception_table: vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 1,
                handler_pc: 1,
                catch_type: 0,
            }],
            attributes: vec![RawAttribute {
                name_index: lines,
                data: vec![0, 1, 0, 0, 0, 7],
            }],
        };

        let bytes = code.to_bytes().unwrap();
        let parsed = CodeAttribute::parse(&bytes).unwrap();
        assert_eq!(parsed, code);
        assert!(parsed.attribute(&symbols, "LineNumberTable").is_some());
        assert!(parsed.attribute(&symbols, "StackMapTable").is_none());
    }

    #[test]
    fn empty_code_is_malformed() {
        let bytes = [0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            CodeAttribute::parse(&bytes),
            Err(Error::Malformed { .. })
        ));
    }
}
