//! Connection to one array server and the [Client] trait that arrays
//! use to reach their runtime.

use crate::array::{array, Array, ArrayId};
use crate::config::{saved_token, save_token, ClientConfig};
use crate::dtype::{DType, Scalar, Value};
use crate::error::ArqError;
use crate::ops::{AssignOp, BinOp, ReduceOp};
use crate::runtime::Runtime;
use crate::transport::{TcpTransport, Transport};
use core::cell::RefCell;
use tracing::debug;

/// One connected array server with its scheduler state. All handles
/// borrow the connection, so it cannot go away under them.
pub struct Connection<T: Transport> {
    runtime: RefCell<Runtime<T>>,
}

impl Connection<TcpTransport> {
    /// Connect using configuration from `arq/client_config.json` and the
    /// token previously saved for that server, if any.
    pub fn connect() -> Result<Self, ArqError> {
        Self::connect_with(ClientConfig::load(), None)
    }

    /// Connect to the configured server. A token passed here replaces the
    /// saved one and is persisted for future sessions.
    pub fn connect_with(config: ClientConfig, access_token: Option<&str>) -> Result<Self, ArqError> {
        let connect_string = config.connect_string();
        let token = match access_token {
            Some(token) if !token.is_empty() => {
                save_token(&connect_string, token);
                token.to_string()
            }
            _ => saved_token(&connect_string).unwrap_or_default(),
        };
        debug!("connecting to {connect_string}");
        let transport = TcpTransport::connect(&config.server, config.port, config.timeout)?;
        Self::with_transport(transport, &config, &token)
    }
}

impl<T: Transport> Connection<T> {
    /// Build a connection over an arbitrary [Transport] and perform the
    /// connect handshake.
    pub fn with_transport(transport: T, config: &ClientConfig, token: &str) -> Result<Self, ArqError> {
        let user = std::env::var("USER").unwrap_or_else(|_| "arq".into());
        let mut runtime = Runtime::new(transport, config, user, token.to_string());
        runtime.handshake()?;
        Ok(Connection { runtime: RefCell::new(runtime) })
    }

    /// Is the connection still up?
    pub fn is_connected(&self) -> bool {
        self.runtime.borrow().is_connected()
    }

    /// Execute everything still sitting in the command queue.
    pub fn flush(&self) -> Result<(), ArqError> {
        self.runtime.borrow_mut().flush_all()
    }

    /// Drain the queue and disconnect from the server.
    pub fn disconnect(&self) -> Result<(), ArqError> {
        self.runtime.borrow_mut().disconnect()
    }

    /// Drain the queue, then stop the remote server and disconnect.
    pub fn shutdown(&self) -> Result<(), ArqError> {
        self.runtime.borrow_mut().shutdown()
    }

    /// Runtime description of the server as raw JSON.
    pub fn get_config(&self) -> Result<String, ArqError> {
        self.runtime.borrow_mut().get_config()
    }

    /// Bytes held by objects in the server symbol table.
    pub fn get_mem_used(&self) -> Result<u64, ArqError> {
        self.runtime.borrow_mut().get_mem_used()
    }

    /// Health check. Returns "imok" when the server responds normally.
    pub fn ruok(&self) -> String {
        self.runtime.borrow_mut().ruok()
    }

    /// New zero filled array.
    pub fn zeros(&self, size: u64, dtype: DType) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().create(dtype, size)?, self))
    }

    /// New array filled with ones.
    pub fn ones(&self, size: u64, dtype: DType) -> Result<Array<&Self>, ArqError> {
        let arr = self.zeros(size, dtype)?;
        arr.fill(Value::Int64(1))?;
        Ok(arr)
    }

    /// Zero filled array with the size and dtype of an existing one.
    pub fn zeros_like(&self, other: &Array<&Self>) -> Result<Array<&Self>, ArqError> {
        self.zeros(other.size(), other.dtype())
    }

    /// Array of ones with the size and dtype of an existing one.
    pub fn ones_like(&self, other: &Array<&Self>) -> Result<Array<&Self>, ArqError> {
        self.ones(other.size(), other.dtype())
    }

    /// Integers from `start` to `stop` stepping by `stride`.
    pub fn arange(&self, start: i64, stop: i64, stride: i64) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().arange(start, stop, stride)?, self))
    }

    /// `length` evenly spaced floats from `start` to `stop` inclusive.
    pub fn linspace(&self, start: f64, stop: f64, length: u64) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().linspace(start, stop, length)?, self))
    }

    /// Random values in `[low, high)` of the given dtype.
    pub fn randint(
        &self,
        low: impl Into<Value>,
        high: impl Into<Value>,
        size: u64,
        dtype: DType,
        seed: Option<u64>,
    ) -> Result<Array<&Self>, ArqError> {
        Ok(array(
            self.runtime.borrow_mut().randint(low.into(), high.into(), size, dtype, seed)?,
            self,
        ))
    }

    /// Uniform random floats in `[low, high)`.
    pub fn uniform(&self, low: f64, high: f64, size: u64, seed: Option<u64>) -> Result<Array<&Self>, ArqError> {
        self.randint(low, high, size, DType::Float64, seed)
    }

    /// Standard normal random floats.
    pub fn random_normal(&self, size: u64, seed: Option<u64>) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().random_normal(size, seed)?, self))
    }

    /// Upload host data as a new server array.
    pub fn array<S: Scalar>(&self, data: &[S]) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().from_slice(data)?, self))
    }

    /// Look up a registered name and return a handle to that array.
    pub fn attach(&self, name: &str) -> Result<Array<&Self>, ArqError> {
        Ok(array(self.runtime.borrow_mut().attach(name)?, self))
    }

    /// Remove a name previously pinned with [Array::register].
    pub fn unregister(&self, name: &str) -> Result<(), ArqError> {
        self.runtime.borrow_mut().unregister(name)
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.borrow_mut().disconnect() {
            debug!("disconnect on drop failed, {e}");
        }
    }
}

/// Client is implemented by references to [Connection]. Arrays are generic
/// over it so that the scheduler state stays owned by the connection
/// instead of living in process globals.
pub trait Client: Copy {
    /// Add one owner to the array behind `x`.
    fn retain(self, x: ArrayId);
    /// Drop one owner of the array behind `x`.
    fn release(self, x: ArrayId);
    /// Element type of `x`.
    fn dtype(self, x: ArrayId) -> DType;
    /// Element count of `x`.
    fn size(self, x: ArrayId) -> u64;
    /// Dimension sizes of `x`.
    fn shape(self, x: ArrayId) -> Vec<u64>;
    /// Rank of `x`.
    fn ndim(self, x: ArrayId) -> u64;
    /// Element size of `x` in bytes.
    fn itemsize(self, x: ArrayId) -> u64;
    /// Command name and argument string that produced `x`.
    fn producing_command(self, x: ArrayId) -> (String, String);
    /// Elementwise `x op y`.
    fn binary(self, op: BinOp, x: ArrayId, y: ArrayId) -> Result<ArrayId, ArqError>;
    /// Elementwise `x op value`.
    fn binary_scalar(self, op: BinOp, x: ArrayId, value: Value) -> Result<ArrayId, ArqError>;
    /// Elementwise `value op x`.
    fn scalar_binary(self, op: BinOp, value: Value, x: ArrayId) -> Result<ArrayId, ArqError>;
    /// In place `x op= y`.
    fn assign_array(self, op: AssignOp, x: ArrayId, y: ArrayId) -> Result<(), ArqError>;
    /// In place `x op= value`.
    fn assign_scalar(self, op: AssignOp, x: ArrayId, value: Value) -> Result<(), ArqError>;
    /// Scalar reduction of `x`.
    fn reduce(self, r: ReduceOp, x: ArrayId) -> Result<Value, ArqError>;
    /// Read one element.
    fn get_scalar(self, x: ArrayId, index: i64) -> Result<Value, ArqError>;
    /// Write one element.
    fn set_scalar(self, x: ArrayId, index: i64, value: Value) -> Result<(), ArqError>;
    /// Extract a strided slice as a new array.
    fn slice(self, x: ArrayId, start: i64, stop: i64, stride: i64) -> Result<ArrayId, ArqError>;
    /// Gather elements by an index or mask array.
    fn gather(self, x: ArrayId, index: ArrayId) -> Result<ArrayId, ArqError>;
    /// Scatter a value over indexed positions.
    fn set_index_scalar(self, x: ArrayId, index: ArrayId, value: Value) -> Result<(), ArqError>;
    /// Scatter an array over indexed positions.
    fn set_index_array(self, x: ArrayId, index: ArrayId, value: ArrayId) -> Result<(), ArqError>;
    /// Assign a value over a slice.
    fn set_slice_scalar(
        self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: Value,
    ) -> Result<(), ArqError>;
    /// Assign an array over a slice.
    fn set_slice_array(
        self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: ArrayId,
    ) -> Result<(), ArqError>;
    /// Fill the whole array with one value.
    fn fill(self, x: ArrayId, value: Value) -> Result<(), ArqError>;
    /// Download the whole array.
    fn to_vec<S: Scalar>(self, x: ArrayId) -> Result<Vec<S>, ArqError>;
    /// Printable form of the array.
    fn str_repr(self, x: ArrayId) -> Result<String, ArqError>;
    /// Pin the array in the server symbol table under a user name.
    fn register(self, x: ArrayId, name: &str) -> Result<(), ArqError>;
}

impl<'a, T: Transport> Client for &'a Connection<T> {
    fn retain(self, x: ArrayId) {
        self.runtime.borrow_mut().retain(x);
    }

    fn release(self, x: ArrayId) {
        self.runtime.borrow_mut().release(x);
    }

    fn dtype(self, x: ArrayId) -> DType {
        self.runtime.borrow().dtype(x)
    }

    fn size(self, x: ArrayId) -> u64 {
        self.runtime.borrow().size(x)
    }

    fn shape(self, x: ArrayId) -> Vec<u64> {
        self.runtime.borrow().shape(x)
    }

    fn ndim(self, x: ArrayId) -> u64 {
        self.runtime.borrow().ndim(x)
    }

    fn itemsize(self, x: ArrayId) -> u64 {
        self.runtime.borrow().itemsize(x)
    }

    fn producing_command(self, x: ArrayId) -> (String, String) {
        self.runtime.borrow().producing_command(x)
    }

    fn binary(self, op: BinOp, x: ArrayId, y: ArrayId) -> Result<ArrayId, ArqError> {
        self.runtime.borrow_mut().binary(op, x, y)
    }

    fn binary_scalar(self, op: BinOp, x: ArrayId, value: Value) -> Result<ArrayId, ArqError> {
        self.runtime.borrow_mut().binary_scalar(op, x, value)
    }

    fn scalar_binary(self, op: BinOp, value: Value, x: ArrayId) -> Result<ArrayId, ArqError> {
        self.runtime.borrow_mut().scalar_binary(op, value, x)
    }

    fn assign_array(self, op: AssignOp, x: ArrayId, y: ArrayId) -> Result<(), ArqError> {
        self.runtime.borrow_mut().assign_array(op, x, y)
    }

    fn assign_scalar(self, op: AssignOp, x: ArrayId, value: Value) -> Result<(), ArqError> {
        self.runtime.borrow_mut().assign_scalar(op, x, value)
    }

    fn reduce(self, r: ReduceOp, x: ArrayId) -> Result<Value, ArqError> {
        self.runtime.borrow_mut().reduce(r, x)
    }

    fn get_scalar(self, x: ArrayId, index: i64) -> Result<Value, ArqError> {
        self.runtime.borrow_mut().get_scalar(x, index)
    }

    fn set_scalar(self, x: ArrayId, index: i64, value: Value) -> Result<(), ArqError> {
        self.runtime.borrow_mut().set_scalar(x, index, value)
    }

    fn slice(self, x: ArrayId, start: i64, stop: i64, stride: i64) -> Result<ArrayId, ArqError> {
        self.runtime.borrow_mut().slice(x, start, stop, stride)
    }

    fn gather(self, x: ArrayId, index: ArrayId) -> Result<ArrayId, ArqError> {
        self.runtime.borrow_mut().gather(x, index)
    }

    fn set_index_scalar(self, x: ArrayId, index: ArrayId, value: Value) -> Result<(), ArqError> {
        self.runtime.borrow_mut().set_index_scalar(x, index, value)
    }

    fn set_index_array(self, x: ArrayId, index: ArrayId, value: ArrayId) -> Result<(), ArqError> {
        self.runtime.borrow_mut().set_index_array(x, index, value)
    }

    fn set_slice_scalar(
        self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: Value,
    ) -> Result<(), ArqError> {
        self.runtime.borrow_mut().set_slice_scalar(x, start, stop, stride, value)
    }

    fn set_slice_array(
        self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: ArrayId,
    ) -> Result<(), ArqError> {
        self.runtime.borrow_mut().set_slice_array(x, start, stop, stride, value)
    }

    fn fill(self, x: ArrayId, value: Value) -> Result<(), ArqError> {
        self.runtime.borrow_mut().fill(x, value)
    }

    fn to_vec<S: Scalar>(self, x: ArrayId) -> Result<Vec<S>, ArqError> {
        self.runtime.borrow_mut().to_vec(x)
    }

    fn str_repr(self, x: ArrayId) -> Result<String, ArqError> {
        self.runtime.borrow_mut().str_repr(x)
    }

    fn register(self, x: ArrayId, name: &str) -> Result<(), ArqError> {
        self.runtime.borrow_mut().register(x, name)
    }
}
