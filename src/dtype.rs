use crate::error::ArqError;

/// Element type of a remote array
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DType {
    /// Boolean type
    Bool,
    /// 64 bit signed integer type
    Int64,
    /// 64 bit floating point type
    Float64,
}

impl DType {
    /// Get the size of DType in bytes
    pub fn byte_size(self) -> u64 {
        match self {
            Self::Bool => 1,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Check if self is floating point dtype
    pub fn is_floating(self) -> bool {
        self == Self::Float64
    }

    /// Wire name of the dtype
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
        }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, ArqError> {
        match name {
            "bool" => Ok(Self::Bool),
            "int64" => Ok(Self::Int64),
            "float64" => Ok(Self::Float64),
            _ => Err(ArqError::parse_error(format!("unknown dtype {name}"))),
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        f.write_str(self.name())
    }
}

/// A single typed value, either passed as a literal operand
/// or parsed from a server reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// 64 bit signed integer value
    Int64(i64),
    /// 64 bit floating point value
    Float64(f64),
}

impl Value {
    /// DType of the value
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
        }
    }

    /// Value as i64, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        if let Self::Int64(x) = self {
            Some(*x)
        } else {
            None
        }
    }

    /// Value as f64, if it is one
    pub fn as_f64(&self) -> Option<f64> {
        if let Self::Float64(x) = self {
            Some(*x)
        } else {
            None
        }
    }

    /// Value as bool, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(x) = self {
            Some(*x)
        } else {
            None
        }
    }

    /// Numeric value widened to f64
    pub fn to_f64(&self) -> f64 {
        match self {
            Self::Bool(x) => u8::from(*x).into(),
            Self::Int64(x) => *x as f64,
            Self::Float64(x) => *x,
        }
    }

    /// Parse a scalar reply of the form "dtype value"
    pub(crate) fn parse(msg: &str) -> Result<Self, ArqError> {
        let mut fields = msg.splitn(2, ' ');
        let dtname = fields
            .next()
            .ok_or_else(|| ArqError::parse_error(format!("empty scalar reply {msg:?}")))?;
        let value = fields
            .next()
            .ok_or_else(|| ArqError::parse_error(format!("scalar reply without value {msg:?}")))?
            .trim();
        match DType::from_name(dtname)? {
            DType::Bool => match value {
                "true" => Ok(Self::Bool(true)),
                "false" => Ok(Self::Bool(false)),
                _ => Err(ArqError::parse_error(format!("unsupported bool value {value:?}"))),
            },
            DType::Int64 => value
                .parse()
                .map(Self::Int64)
                .map_err(|e| ArqError::parse_error(format!("unsupported int64 value {value:?}, {e}"))),
            DType::Float64 => value
                .parse()
                .map(Self::Float64)
                .map_err(|e| ArqError::parse_error(format!("unsupported float64 value {value:?}, {e}"))),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}

// The Display output is the canonical literal encoding used both on the wire
// and in cache keys, so two textually equal literals are the same operand.
impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        match self {
            Self::Bool(x) => f.write_str(if *x { "true" } else { "false" }),
            Self::Int64(x) => f.write_fmt(format_args!("{x}")),
            Self::Float64(x) => f.write_fmt(format_args!("{x:.17}")),
        }
    }
}

/// Scalar trait is implemented for all element types that can live
/// in a remote array and be transferred in binary form.
pub trait Scalar: Clone + Copy + core::fmt::Debug + 'static {
    /// Get dtype of Self
    fn dtype() -> DType;
    /// Byte size of Self on the wire
    fn byte_size() -> usize;
    /// From little endian bytes
    fn from_le_bytes(bytes: &[u8]) -> Self;
    /// Append self to buf as little endian bytes
    fn write_le_bytes(self, buf: &mut Vec<u8>);
    /// Convert self into a [Value]
    fn into_value(self) -> Value;
    /// Convert a [Value] back into Self, if the dtype matches
    fn from_value(value: &Value) -> Option<Self>;
}

impl Scalar for i64 {
    fn dtype() -> DType {
        DType::Int64
    }

    fn byte_size() -> usize {
        8
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        i64::from_le_bytes(bytes.try_into().unwrap())
    }

    fn write_le_bytes(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn into_value(self) -> Value {
        Value::Int64(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl Scalar for f64 {
    fn dtype() -> DType {
        DType::Float64
    }

    fn byte_size() -> usize {
        8
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        f64::from_le_bytes(bytes.try_into().unwrap())
    }

    fn write_le_bytes(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn into_value(self) -> Value {
        Value::Float64(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl Scalar for bool {
    fn dtype() -> DType {
        DType::Bool
    }

    fn byte_size() -> usize {
        1
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le_bytes(self, buf: &mut Vec<u8>) {
        buf.push(u8::from(self));
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

#[test]
fn literal_encoding_is_stable() {
    assert_eq!(Value::Int64(-3).to_string(), "-3");
    assert_eq!(Value::Bool(true).to_string(), "true");
    // Two f64 literals that compare equal must encode identically,
    // otherwise cache keys formed from them would diverge.
    assert_eq!(Value::Float64(0.1).to_string(), Value::Float64(0.1).to_string());
    assert_eq!(Value::Float64(1.0).to_string(), "1.00000000000000000");
}

#[test]
fn scalar_reply_parsing() {
    assert_eq!(Value::parse("int64 42").unwrap(), Value::Int64(42));
    assert_eq!(Value::parse("float64 0.5").unwrap(), Value::Float64(0.5));
    assert_eq!(Value::parse("bool true").unwrap(), Value::Bool(true));
    assert!(Value::parse("int64").is_err());
    assert!(Value::parse("complex128 1+2i").is_err());
}
