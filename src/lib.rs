//! # arq
//!
//! arq is a deferred execution client for remote array servers. Arrays live
//! in the server process, the client holds handles and schedules commands:
//! mutating operations are batched in a small queue and flushed in
//! dependency safe order, repeated computations are answered from a result
//! cache instead of the wire, and freed server storage is recycled for new
//! results of matching type and size.
//!
//! ```no_run
//! let conn = arq::Connection::connect()?;
//! let x = conn.arange(0, 100, 1)?;
//! let y = conn.ones(100, arq::DType::Int64)?;
//! let z = &x + &y;
//! println!("{}", z.sum()?.to_f64());
//! # Ok::<(), arq::ArqError>(())
//! ```

mod array;
mod client;
mod config;
mod dtype;
mod error;
mod message;
mod ops;
mod pool;
mod queue;
mod registry;
mod runtime;
mod transport;

pub use array::{Array, ArrayId};
pub use client::{Client, Connection};
pub use config::ClientConfig;
pub use dtype::{DType, Scalar, Value};
pub use error::ArqError;
pub use message::{decode_binary_reply, decode_reply, Created, ReplyMessage, RequestMessage};
pub use ops::{AssignOp, BinOp, ReduceOp};
pub use transport::{TcpTransport, Transport};
