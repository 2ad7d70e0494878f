//! Client side handle of one remote array.
//!
//! An [Array] owns one reference to the entry behind its identity. Cloning
//! retains, dropping releases, and the runtime decides whether a release
//! destroys the entry now, later, or recycles its storage.

use crate::client::Client;
use crate::dtype::{DType, Scalar, Value};
use crate::error::ArqError;
use crate::ops::{AssignOp, BinOp, ReduceOp};

/// Logical identity of a remote array. The index addresses an arena slot
/// in the runtime, the generation detects slot reuse.
#[derive(Clone, Copy, PartialOrd, PartialEq, Ord, Eq, Debug)]
pub struct ArrayId {
    index: u32,
    generation: u32,
}

impl ArrayId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        ArrayId { index, generation }
    }

    pub(crate) const fn index(self) -> u32 {
        self.index
    }

    pub(crate) const fn generation(self) -> u32 {
        self.generation
    }

    /// Parse a wire token of the form `id_{index}_{generation}`.
    pub(crate) fn parse_token(token: &str) -> Option<Self> {
        let rest = token.strip_prefix("id_")?;
        let (index, generation) = rest.split_once('_')?;
        Some(ArrayId { index: index.parse().ok()?, generation: generation.parse().ok()? })
    }
}

// The Display form is the identity token used in argument strings. The
// `id_` prefix is what the dependency scanner keys on.
impl core::fmt::Display for ArrayId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("id_{}_{}", self.index, self.generation))
    }
}

/// Handle to one array living in the remote executor. The data stays on
/// the server, the handle only carries identity and metadata.
pub struct Array<C: Client> {
    id: ArrayId,
    client: C,
}

/// Create a new array handle from id and client.
/// Used mostly internally in the connection.
pub(crate) const fn array<C: Client>(id: ArrayId, client: C) -> Array<C> {
    Array { id, client }
}

impl<C: Client> Clone for Array<C> {
    fn clone(&self) -> Self {
        self.client.retain(self.id);
        array(self.id, self.client)
    }
}

impl<C: Client> Drop for Array<C> {
    fn drop(&mut self) {
        self.client.release(self.id);
    }
}

impl<C: Client> core::fmt::Debug for Array<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("Array {{ id = {} }}", self.id))
    }
}

impl<C: Client> core::fmt::Display for Array<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.client.str_repr(self.id) {
            Ok(repr) => f.write_str(&repr),
            Err(_) => f.write_str("array failed to materialize"),
        }
    }
}

impl<C: Client> Array<C> {
    // Metadata
    /// The array's logical identity.
    /// Any array on one connection will always have a different id.
    pub fn id(&self) -> ArrayId {
        self.id
    }

    /// Element type of the array.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.client.dtype(self.id)
    }

    /// Number of elements in the array.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.client.size(self.id)
    }

    /// Dimension sizes of the array.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.client.shape(self.id)
    }

    /// Rank of the array, currently always 1.
    #[must_use]
    pub fn rank(&self) -> u64 {
        self.client.ndim(self.id)
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn itemsize(&self) -> u64 {
        self.client.itemsize(self.id)
    }

    /// Command name and argument string that produced this array.
    pub fn producing_command(&self) -> (String, String) {
        self.client.producing_command(self.id)
    }

    // Elementwise operations

    /// Elementwise `self op rhs`. The fallible form of the operators.
    pub fn binary(&self, op: BinOp, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        Ok(array(self.client.binary(op, self.id, rhs.id)?, self.client))
    }

    /// Elementwise `self op value`.
    pub fn binary_value(&self, op: BinOp, value: impl Into<Value>) -> Result<Array<C>, ArqError> {
        Ok(array(self.client.binary_scalar(op, self.id, value.into())?, self.client))
    }

    /// Elementwise `value op self`, for the non commutative operators.
    pub fn rbinary_value(&self, op: BinOp, value: impl Into<Value>) -> Result<Array<C>, ArqError> {
        Ok(array(self.client.scalar_binary(op, value.into(), self.id)?, self.client))
    }

    /// In place `self op= rhs`.
    pub fn assign(&self, op: AssignOp, rhs: &Array<C>) -> Result<(), ArqError> {
        self.client.assign_array(op, self.id, rhs.id)
    }

    /// In place `self op= value`.
    pub fn assign_value(&self, op: AssignOp, value: impl Into<Value>) -> Result<(), ArqError> {
        self.client.assign_scalar(op, self.id, value.into())
    }

    /// Elementwise `self ** rhs`.
    pub fn pow(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::Pow, rhs)
    }

    /// Elementwise `self ** value`.
    pub fn pow_value(&self, value: impl Into<Value>) -> Result<Array<C>, ArqError> {
        self.binary_value(BinOp::Pow, value)
    }

    /// Elementwise `self // rhs`.
    pub fn floordiv(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::FloorDiv, rhs)
    }

    /// Elementwise `self // value`.
    pub fn floordiv_value(&self, value: impl Into<Value>) -> Result<Array<C>, ArqError> {
        self.binary_value(BinOp::FloorDiv, value)
    }

    /// Elementwise `self < rhs` as a bool array.
    pub fn cmplt(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::Lt, rhs)
    }

    /// Elementwise `self > rhs` as a bool array.
    pub fn cmpgt(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::Gt, rhs)
    }

    /// Elementwise `self <= rhs` as a bool array.
    pub fn cmple(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::Le, rhs)
    }

    /// Elementwise `self >= rhs` as a bool array.
    pub fn cmpge(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        self.binary(BinOp::Ge, rhs)
    }

    /// Elementwise `self == rhs` as a bool array.
    pub fn cmpeq(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        if self.dtype() == DType::Bool && rhs.dtype() == DType::Bool {
            return self.binary(BinOp::Xor, rhs)?.invert();
        }
        self.binary(BinOp::Eq, rhs)
    }

    /// Elementwise `self != rhs` as a bool array.
    pub fn cmpne(&self, rhs: &Array<C>) -> Result<Array<C>, ArqError> {
        if self.dtype() == DType::Bool && rhs.dtype() == DType::Bool {
            return self.binary(BinOp::Xor, rhs);
        }
        self.binary(BinOp::Ne, rhs)
    }

    /// Elementwise bitwise or logical negation.
    pub fn invert(&self) -> Result<Array<C>, ArqError> {
        match self.dtype() {
            DType::Int64 => self.binary_value(BinOp::Xor, !0i64),
            DType::Bool => self.binary_value(BinOp::Xor, true),
            DType::Float64 => Err(ArqError::dtype_error("cannot invert a float64 array")),
        }
    }

    // Reductions

    /// Sum of all elements.
    pub fn sum(&self) -> Result<Value, ArqError> {
        self.client.reduce(ReduceOp::Sum, self.id)
    }

    /// Product of all elements.
    pub fn prod(&self) -> Result<Value, ArqError> {
        self.client.reduce(ReduceOp::Prod, self.id)
    }

    /// Minimum element.
    pub fn min(&self) -> Result<Value, ArqError> {
        self.client.reduce(ReduceOp::Min, self.id)
    }

    /// Maximum element.
    pub fn max(&self) -> Result<Value, ArqError> {
        self.client.reduce(ReduceOp::Max, self.id)
    }

    /// Index of the minimum element.
    pub fn argmin(&self) -> Result<i64, ArqError> {
        let value = self.client.reduce(ReduceOp::Argmin, self.id)?;
        value
            .as_i64()
            .ok_or_else(|| ArqError::parse_error(format!("argmin returned {value:?}")))
    }

    /// Index of the maximum element.
    pub fn argmax(&self) -> Result<i64, ArqError> {
        let value = self.client.reduce(ReduceOp::Argmax, self.id)?;
        value
            .as_i64()
            .ok_or_else(|| ArqError::parse_error(format!("argmax returned {value:?}")))
    }

    /// True iff any element is truthy.
    pub fn any(&self) -> Result<bool, ArqError> {
        let value = self.client.reduce(ReduceOp::Any, self.id)?;
        value.as_bool().ok_or_else(|| ArqError::parse_error(format!("any returned {value:?}")))
    }

    /// True iff all elements are truthy.
    pub fn all(&self) -> Result<bool, ArqError> {
        let value = self.client.reduce(ReduceOp::All, self.id)?;
        value.as_bool().ok_or_else(|| ArqError::parse_error(format!("all returned {value:?}")))
    }

    /// True iff the array is monotonically non decreasing.
    pub fn is_sorted(&self) -> Result<bool, ArqError> {
        let value = self.client.reduce(ReduceOp::IsSorted, self.id)?;
        value
            .as_bool()
            .ok_or_else(|| ArqError::parse_error(format!("is_sorted returned {value:?}")))
    }

    /// Arithmetic mean of all elements.
    pub fn mean(&self) -> Result<f64, ArqError> {
        Ok(self.sum()?.to_f64() / self.size() as f64)
    }

    /// Population variance of all elements.
    pub fn var(&self) -> Result<f64, ArqError> {
        let squares = self.binary(BinOp::Mul, self)?;
        let mean = self.mean()?;
        Ok(squares.mean()? - mean * mean)
    }

    /// Population standard deviation of all elements.
    pub fn std(&self) -> Result<f64, ArqError> {
        Ok(self.var()?.sqrt())
    }

    // Indexing

    /// Read one element. Negative indices count from the end.
    pub fn get(&self, index: i64) -> Result<Value, ArqError> {
        self.client.get_scalar(self.id, index)
    }

    /// Write one element. Negative indices count from the end.
    pub fn set(&self, index: i64, value: impl Into<Value>) -> Result<(), ArqError> {
        self.client.set_scalar(self.id, index, value.into())
    }

    /// Extract a strided slice as a new array. Negative bounds count from
    /// the end.
    pub fn slice(&self, start: i64, stop: i64, stride: i64) -> Result<Array<C>, ArqError> {
        Ok(array(self.client.slice(self.id, start, stop, stride)?, self.client))
    }

    /// Assign a value over a slice.
    pub fn set_slice(
        &self,
        start: i64,
        stop: i64,
        stride: i64,
        value: impl Into<Value>,
    ) -> Result<(), ArqError> {
        self.client.set_slice_scalar(self.id, start, stop, stride, value.into())
    }

    /// Assign an array over a slice.
    pub fn set_slice_array(
        &self,
        start: i64,
        stop: i64,
        stride: i64,
        value: &Array<C>,
    ) -> Result<(), ArqError> {
        self.client.set_slice_array(self.id, start, stop, stride, value.id)
    }

    /// Gather the elements selected by an int64 index array or a bool mask.
    pub fn gather(&self, index: &Array<C>) -> Result<Array<C>, ArqError> {
        Ok(array(self.client.gather(self.id, index.id)?, self.client))
    }

    /// Scatter a value over the positions selected by `index`.
    pub fn set_index(&self, index: &Array<C>, value: impl Into<Value>) -> Result<(), ArqError> {
        self.client.set_index_scalar(self.id, index.id, value.into())
    }

    /// Scatter an array over the positions selected by `index`.
    pub fn set_index_array(&self, index: &Array<C>, value: &Array<C>) -> Result<(), ArqError> {
        self.client.set_index_array(self.id, index.id, value.id)
    }

    /// Fill the array in place with a constant value.
    pub fn fill(&self, value: impl Into<Value>) -> Result<(), ArqError> {
        self.client.fill(self.id, value.into())
    }

    // Transfer and registration

    /// Download the array into host memory.
    pub fn to_vec<S: Scalar>(&self) -> Result<Vec<S>, ArqError> {
        self.client.to_vec(self.id)
    }

    /// Pin this array in the server symbol table under a user name, making
    /// it reachable across sessions until unregistered.
    pub fn register(&self, name: &str) -> Result<(), ArqError> {
        self.client.register(self.id, name)
    }
}

// Operators mirror the fallible methods above and panic on transport or
// server failures.

macro_rules! impl_array_binary {
    ($optrait:ident, $fn:ident, $op:expr) => {
        impl<C: Client> core::ops::$optrait<&Array<C>> for &Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: &Array<C>) -> Array<C> {
                self.binary($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<Array<C>> for &Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: Array<C>) -> Array<C> {
                self.binary($op, &rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<&Array<C>> for Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: &Array<C>) -> Array<C> {
                self.binary($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<Array<C>> for Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: Array<C>) -> Array<C> {
                self.binary($op, &rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<i64> for &Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: i64) -> Array<C> {
                self.binary_value($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<i64> for Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: i64) -> Array<C> {
                self.binary_value($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<f64> for &Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: f64) -> Array<C> {
                self.binary_value($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<f64> for Array<C> {
            type Output = Array<C>;
            fn $fn(self, rhs: f64) -> Array<C> {
                self.binary_value($op, rhs).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<&Array<C>> for i64 {
            type Output = Array<C>;
            fn $fn(self, rhs: &Array<C>) -> Array<C> {
                rhs.rbinary_value($op, self).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<Array<C>> for i64 {
            type Output = Array<C>;
            fn $fn(self, rhs: Array<C>) -> Array<C> {
                rhs.rbinary_value($op, self).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<&Array<C>> for f64 {
            type Output = Array<C>;
            fn $fn(self, rhs: &Array<C>) -> Array<C> {
                rhs.rbinary_value($op, self).unwrap()
            }
        }

        impl<C: Client> core::ops::$optrait<Array<C>> for f64 {
            type Output = Array<C>;
            fn $fn(self, rhs: Array<C>) -> Array<C> {
                rhs.rbinary_value($op, self).unwrap()
            }
        }
    };
}

impl_array_binary!(Add, add, BinOp::Add);
impl_array_binary!(Sub, sub, BinOp::Sub);
impl_array_binary!(Mul, mul, BinOp::Mul);
impl_array_binary!(Div, div, BinOp::Div);
impl_array_binary!(Rem, rem, BinOp::Mod);
impl_array_binary!(BitAnd, bitand, BinOp::And);
impl_array_binary!(BitOr, bitor, BinOp::Or);
impl_array_binary!(BitXor, bitxor, BinOp::Xor);
impl_array_binary!(Shl, shl, BinOp::Shl);
impl_array_binary!(Shr, shr, BinOp::Shr);

macro_rules! impl_array_assign {
    ($optrait:ident, $fn:ident, $op:expr) => {
        impl<C: Client> core::ops::$optrait<&Array<C>> for Array<C> {
            fn $fn(&mut self, rhs: &Array<C>) {
                self.assign($op, rhs).unwrap();
            }
        }

        impl<C: Client> core::ops::$optrait<Array<C>> for Array<C> {
            fn $fn(&mut self, rhs: Array<C>) {
                self.assign($op, &rhs).unwrap();
            }
        }

        impl<C: Client> core::ops::$optrait<i64> for Array<C> {
            fn $fn(&mut self, rhs: i64) {
                self.assign_value($op, rhs).unwrap();
            }
        }

        impl<C: Client> core::ops::$optrait<f64> for Array<C> {
            fn $fn(&mut self, rhs: f64) {
                self.assign_value($op, rhs).unwrap();
            }
        }
    };
}

impl_array_assign!(AddAssign, add_assign, AssignOp::Add);
impl_array_assign!(SubAssign, sub_assign, AssignOp::Sub);
impl_array_assign!(MulAssign, mul_assign, AssignOp::Mul);
impl_array_assign!(DivAssign, div_assign, AssignOp::Div);
impl_array_assign!(BitAndAssign, bitand_assign, AssignOp::And);
impl_array_assign!(BitOrAssign, bitor_assign, AssignOp::Or);
impl_array_assign!(BitXorAssign, bitxor_assign, AssignOp::Xor);
impl_array_assign!(ShlAssign, shl_assign, AssignOp::Shl);
impl_array_assign!(ShrAssign, shr_assign, AssignOp::Shr);

impl<C: Client> core::ops::Neg for &Array<C> {
    type Output = Array<C>;
    fn neg(self) -> Array<C> {
        self.binary_value(BinOp::Mul, -1i64).unwrap()
    }
}

impl<C: Client> core::ops::Neg for Array<C> {
    type Output = Array<C>;
    fn neg(self) -> Array<C> {
        self.binary_value(BinOp::Mul, -1i64).unwrap()
    }
}

impl<C: Client> core::ops::Not for &Array<C> {
    type Output = Array<C>;
    fn not(self) -> Array<C> {
        self.invert().unwrap()
    }
}

impl<C: Client> core::ops::Not for Array<C> {
    type Output = Array<C>;
    fn not(self) -> Array<C> {
        self.invert().unwrap()
    }
}

#[test]
fn identity_tokens_roundtrip() {
    let id = ArrayId::new(17, 3);
    assert_eq!(id.to_string(), "id_17_3");
    assert_eq!(ArrayId::parse_token("id_17_3"), Some(id));
    assert_eq!(ArrayId::parse_token("sv_17"), None);
    assert_eq!(ArrayId::parse_token("id_17"), None);
    assert_eq!(ArrayId::parse_token("17_3"), None);
}
