//! Field and method descriptor parsing.
//!
//! Descriptors drive every stack computation in the crate: how many operand slots a field
//! access pushes, how many argument slots a method consumes, how a primitive value is
//! boxed before it is handed to a runtime helper and how it is unboxed afterwards.

use std::fmt;

use crate::Result;

/// Boxing information for one primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxInfo {
    /// Internal name of the wrapper type (`java/lang/Integer`)
    pub wrapper: &'static str,
    /// Descriptor of the static `valueOf` factory on the wrapper
    pub value_of: &'static str,
    /// Name of the unboxing accessor (`intValue`)
    pub unbox_name: &'static str,
    /// Descriptor of the unboxing accessor (`()I`)
    pub unbox_descriptor: &'static str,
}

/// A parsed field type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `D`
    Double,
    /// `F`
    Float,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `S`
    Short,
    /// `Z`
    Boolean,
    /// `Lname;` holding the internal name
    Object(String),
    /// `[...` holding the complete array descriptor
    Array(String),
}

impl FieldType {
    /// Parses a complete field descriptor.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `descriptor` is not exactly one field type.
    pub fn parse(descriptor: &str) -> Result<FieldType> {
        let mut pos = 0;
        let parsed = Self::parse_at(descriptor, &mut pos)?;
        if pos != descriptor.len() {
            return Err(malformed_error!("Trailing data in field descriptor {}", descriptor));
        }
        Ok(parsed)
    }

    fn parse_at(descriptor: &str, pos: &mut usize) -> Result<FieldType> {
        let bytes = descriptor.as_bytes();
        let start = *pos;
        let Some(&first) = bytes.get(start) else {
            return Err(malformed_error!("Truncated descriptor {}", descriptor));
        };
        *pos += 1;

        Ok(match first {
            b'B' => FieldType::Byte,
            b'C' => FieldType::Char,
            b'D' => FieldType::Double,
            b'F' => FieldType::Float,
            b'I' => FieldType::Int,
            b'J' => FieldType::Long,
            b'S' => FieldType::Short,
            b'Z' => FieldType::Boolean,
            b'L' => {
                let Some(end) = descriptor[start..].find(';') else {
                    return Err(malformed_error!("Unterminated class in {}", descriptor));
                };
                *pos = start + end + 1;
                FieldType::Object(descriptor[start + 1..start + end].to_string())
            }
            b'[' => {
                Self::parse_at(descriptor, pos)?;
                FieldType::Array(descriptor[start..*pos].to_string())
            }
            other => {
                return Err(malformed_error!(
                    "Invalid descriptor character '{}' in {}",
                    other as char,
                    descriptor
                ))
            }
        })
    }

    /// Number of local-variable or operand-stack slots a value of this type occupies.
    #[must_use]
    pub fn slots(&self) -> u16 {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// Returns `true` for `long` and `double`.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }

    /// Returns `true` for the eight primitive types.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        !matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    /// Returns the name usable as a `Class` symbol: the internal name of an object type or
    /// the descriptor of an array type. Primitives have none.
    #[must_use]
    pub fn class_name(&self) -> Option<&str> {
        match self {
            FieldType::Object(name) | FieldType::Array(name) => Some(name),
            _ => None,
        }
    }

    /// Boxing information for a primitive type.
    #[must_use]
    pub fn boxing(&self) -> Option<BoxInfo> {
        let (wrapper, value_of, unbox_name, unbox_descriptor) = match self {
            FieldType::Boolean => (
                "java/lang/Boolean",
                "(Z)Ljava/lang/Boolean;",
                "booleanValue",
                "()Z",
            ),
            FieldType::Byte => ("java/lang/Byte", "(B)Ljava/lang/Byte;", "byteValue", "()B"),
            FieldType::Char => (
                "java/lang/Character",
                "(C)Ljava/lang/Character;",
                "charValue",
                "()C",
            ),
            FieldType::Short => (
                "java/lang/Short",
                "(S)Ljava/lang/Short;",
                "shortValue",
                "()S",
            ),
            FieldType::Int => (
                "java/lang/Integer",
                "(I)Ljava/lang/Integer;",
                "intValue",
                "()I",
            ),
            FieldType::Long => ("java/lang/Long", "(J)Ljava/lang/Long;", "longValue", "()J"),
            FieldType::Float => (
                "java/lang/Float",
                "(F)Ljava/lang/Float;",
                "floatValue",
                "()F",
            ),
            FieldType::Double => (
                "java/lang/Double",
                "(D)Ljava/lang/Double;",
                "doubleValue",
                "()D",
            ),
            FieldType::Object(_) | FieldType::Array(_) => return None,
        };
        Some(BoxInfo {
            wrapper,
            value_of,
            unbox_name,
            unbox_descriptor,
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Double => f.write_str("D"),
            FieldType::Float => f.write_str("F"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Short => f.write_str("S"),
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(descriptor) => f.write_str(descriptor),
        }
    }
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Parameter types in declaration order
    pub parameters: Vec<FieldType>,
    /// Return type, `None` for `void`
    pub returns: Option<FieldType>,
}

impl MethodDescriptor {
    /// Parses a method descriptor such as `(ILjava/lang/String;)V`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the descriptor is not well formed.
    pub fn parse(descriptor: &str) -> Result<MethodDescriptor> {
        if !descriptor.starts_with('(') {
            return Err(malformed_error!("Method descriptor {} lacks '('", descriptor));
        }

        let mut pos = 1;
        let mut parameters = Vec::new();
        loop {
            match descriptor.as_bytes().get(pos) {
                Some(b')') => break,
                Some(_) => parameters.push(FieldType::parse_at(descriptor, &mut pos)?),
                None => return Err(malformed_error!("Unterminated parameters in {}", descriptor)),
            }
        }
        pos += 1;

        let returns = if &descriptor[pos..] == "V" {
            None
        } else {
            let mut end = pos;
            let parsed = FieldType::parse_at(descriptor, &mut end)?;
            if end != descriptor.len() {
                return Err(malformed_error!("Trailing data in method descriptor {}", descriptor));
            }
            Some(parsed)
        };

        Ok(MethodDescriptor {
            parameters,
            returns,
        })
    }

    /// Total slots consumed by the parameters, excluding any receiver.
    #[must_use]
    pub fn argument_slots(&self) -> u16 {
        self.parameters.iter().map(FieldType::slots).sum()
    }

    /// Slots pushed by the return value.
    #[must_use]
    pub fn return_slots(&self) -> u16 {
        self.returns.as_ref().map_or(0, FieldType::slots)
    }
}

/// Net operand-stack effect of a field access instruction, in slots.
///
/// `is_static` and `is_put` select between the four access opcodes.
#[must_use]
pub fn field_access_delta(field: &FieldType, is_static: bool, is_put: bool) -> i32 {
    let value = i32::from(field.slots());
    let receiver = i32::from(!is_static);
    if is_put {
        -(value + receiver)
    } else {
        value - receiver
    }
}

/// Net operand-stack effect of invoking `method`, in slots.
#[must_use]
pub fn invoke_delta(method: &MethodDescriptor, has_receiver: bool) -> i32 {
    i32::from(method.return_slots())
        - i32::from(method.argument_slots())
        - i32::from(has_receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_types() {
        assert_eq!(FieldType::parse("I").unwrap(), FieldType::Int);
        assert_eq!(
            FieldType::parse("Ljava/lang/String;").unwrap(),
            FieldType::Object("java/lang/String".into())
        );
        assert_eq!(
            FieldType::parse("[[J").unwrap(),
            FieldType::Array("[[J".into())
        );
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("Ljava/lang/String").is_err());
        assert!(FieldType::parse("").is_err());
    }

    #[test]
    fn parses_method_descriptors() {
        let method = MethodDescriptor::parse("(IJ[Ljava/lang/Object;D)Ljava/lang/String;").unwrap();
        assert_eq!(method.parameters.len(), 4);
        assert_eq!(method.argument_slots(), 6);
        assert_eq!(method.return_slots(), 1);

        let void = MethodDescriptor::parse("()V").unwrap();
        assert!(void.returns.is_none());
        assert_eq!(void.argument_slots(), 0);

        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("I)V").is_err());
        assert!(MethodDescriptor::parse("()VV").is_err());
    }

    #[test]
    fn stack_deltas() {
        assert_eq!(field_access_delta(&FieldType::Int, false, true), -2);
        assert_eq!(field_access_delta(&FieldType::Long, true, true), -2);
        assert_eq!(field_access_delta(&FieldType::Double, false, false), 1);
        assert_eq!(field_access_delta(&FieldType::Int, true, false), 1);

        let method = MethodDescriptor::parse("(Ljava/lang/Object;J)I").unwrap();
        assert_eq!(invoke_delta(&method, true), -3);
        assert_eq!(invoke_delta(&method, false), -2);
    }

    #[test]
    fn boxing_table() {
        let info = FieldType::Char.boxing().unwrap();
        assert_eq!(info.wrapper, "java/lang/Character");
        assert_eq!(info.unbox_name, "charValue");
        assert!(FieldType::Object("a/B".into()).boxing().is_none());
        assert_eq!(FieldType::Array("[I".into()).class_name(), Some("[I"));
        assert_eq!(FieldType::Object("a/B".into()).to_string(), "La/B;");
    }
}
