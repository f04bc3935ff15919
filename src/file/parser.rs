//! Cursor-based byte stream parser for class-file decoding.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked cursor over
//! a byte slice. Every structure in a class file (constant pool entries, member tables,
//! attributes, the bytecode of a `Code` attribute) is read through it.
//!
//! # Examples
//!
//! ```rust
//! use hotswap::Parser;
//!
//! let data = [0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x34];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_be::<u32>()?, 0xCAFE_BABE);
//! assert_eq!(parser.read_be::<u16>()?, 52);
//! assert!(!parser.has_more_data());
//! # Ok::<(), hotswap::Error>(())
//! ```

use crate::{
    file::io::{read_be_at, BinIO},
    Result,
};

/// A generic binary data parser for reading class-file structures.
///
/// The parser maintains an internal position cursor and provides bounds checking
/// to prevent buffer overruns when reading malformed or truncated data.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there are bytes left to read.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the cursor to an absolute position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Advance the cursor by `step` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing would pass the end of the data.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let end = self.calc_end_position(step)?;
        self.position = end;
        Ok(())
    }

    /// Returns the current position of the cursor.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Returns the full underlying data.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the number of bytes left after the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Read a type `T` from the current position in big-endian format and advance the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_be<T: BinIO>(&mut self) -> Result<T> {
        read_be_at::<T>(self.data, &mut self.position)
    }

    /// Peek at a type `T` at the current position without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn peek_be<T: BinIO>(&self) -> Result<T> {
        let mut temp_position = self.position;
        read_be_at::<T>(self.data, &mut temp_position)
    }

    /// Read `length` raw bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Advance the cursor to the next multiple of `alignment`, measured from `origin`.
    ///
    /// Used for the padding in front of `tableswitch`/`lookupswitch` operands, which is
    /// relative to the start of the code array rather than the start of the buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if aligning would exceed the data length.
    pub fn align_from(&mut self, origin: usize, alignment: usize) -> Result<()> {
        let relative = self.position - origin;
        let padding = (alignment - (relative % alignment)) % alignment;
        self.advance_by(padding)
    }

    fn calc_end_position(&self, length: usize) -> Result<usize> {
        match self.position.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(end),
            _ => Err(out_of_bounds_error!()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_be::<u16>().unwrap(), 1);
        assert_eq!(parser.read_be::<u32>().unwrap(), 2);
        assert!(!parser.has_more_data());
        assert!(parser.read_be::<u8>().is_err());
    }

    #[test]
    fn read_bytes_and_seek() {
        let data = [1, 2, 3, 4, 5];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_bytes(3).unwrap(), &[1, 2, 3]);
        assert_eq!(parser.remaining(), 2);
        parser.seek(1).unwrap();
        assert_eq!(parser.peek_be::<u8>().unwrap(), 2);
        assert_eq!(parser.pos(), 1);
        assert!(parser.read_bytes(5).is_err());
        assert!(parser.seek(6).is_err());
    }

    #[test]
    fn align_relative_to_origin() {
        let data = [0u8; 16];
        let mut parser = Parser::new(&data);
        parser.seek(5).unwrap();
        // code array starts at 2, so relative position 3 aligns to 4
        parser.align_from(2, 4).unwrap();
        assert_eq!(parser.pos(), 6);
        parser.align_from(2, 4).unwrap();
        assert_eq!(parser.pos(), 6);
    }
}
