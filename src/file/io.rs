//! Big-endian byte order reading and writing utilities for class-file parsing.
//!
//! Class files store every multi-byte quantity in big-endian order. This module provides
//! the [`crate::file::io::BinIO`] trait together with bounds-checked helpers for reading
//! primitive values out of byte buffers and appending them to output buffers.
//!
//! # Key Components
//!
//! - [`crate::file::io::BinIO`] - Trait defining big-endian conversion for primitive types
//! - [`crate::file::io::read_be`] - Read a value from the start of a buffer
//! - [`crate::file::io::read_be_at`] - Read a value at an offset and advance the offset
//! - [`crate::file::io::write_be_at`] - Overwrite a value at an offset and advance the offset
//! - [`crate::file::io::ByteSink`] - Append big-endian values to a growable buffer
//!
//! # Examples
//!
//! ```rust,ignore
//! use hotswap::file::io::{read_be_at, ByteSink};
//!
//! let mut out = Vec::new();
//! out.put_be(0xCAFE_BABE_u32);
//! out.put_be(52_u16);
//!
//! let mut offset = 0;
//! let magic: u32 = read_be_at(&out, &mut offset)?;
//! assert_eq!(magic, 0xCAFE_BABE);
//! assert_eq!(offset, 4);
//! # Ok::<(), hotswap::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All reading and writing functions return [`crate::Result<T>`] and report
//! [`crate::Error::OutOfBounds`] when the buffer is too short.

use crate::Result;

/// Trait for implementing type-specific big-endian binary conversion.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait BinIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in big-endian
    fn from_be_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in big-endian
    fn to_be_bytes(self) -> Self::Bytes;
}

macro_rules! impl_bin_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl BinIO for $ty {
                type Bytes = [u8; $len];

                fn from_be_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                fn to_be_bytes(self) -> Self::Bytes {
                    <$ty>::to_be_bytes(self)
                }
            }
        )*
    };
}

impl_bin_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
}

/// Safely reads a value of type `T` in big-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_be<T: BinIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_be_at(data, &mut offset)
}

/// Safely reads a value of type `T` in big-endian byte order at a specific offset,
/// advancing the offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_be_at<T: BinIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..*offset + type_len].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset += type_len;

    Ok(T::from_be_bytes(read))
}

/// Safely overwrites a value of type `T` in big-endian byte order at a specific offset,
/// advancing the offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_be_at<T: BinIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..*offset + type_len].copy_from_slice(value.to_be_bytes().as_ref());
    *offset += type_len;

    Ok(())
}

/// Appends big-endian encoded values to a growable buffer.
pub trait ByteSink {
    /// Append `value` in big-endian byte order.
    fn put_be<T: BinIO>(&mut self, value: T);
}

impl ByteSink for Vec<u8> {
    fn put_be<T: BinIO>(&mut self, value: T) {
        self.extend_from_slice(value.to_be_bytes().as_ref());
    }
}
