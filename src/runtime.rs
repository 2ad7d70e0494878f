//! Runtime owns the scheduler state of one connection: the arena of array
//! entries, the deferred command queue, the result cache and the slot pool.
//!
//! Every remote operation funnels through [Runtime::submit_deferred] or
//! [Runtime::submit_sync]. Deferred commands sit in the queue until they are
//! forced out by capacity or until something that needs a value executes
//! them, dependencies first.

use crate::array::ArrayId;
use crate::config::ClientConfig;
use crate::dtype::{DType, Scalar, Value};
use crate::error::ArqError;
use crate::message::{Created, RequestMessage};
use crate::ops::{AssignOp, BinOp, ReduceOp};
use crate::pool::SlotPool;
use crate::queue::{is_identity_token, CommandQueue, Seq};
use crate::registry::OpCache;
use crate::transport::Transport;
use std::collections::BTreeMap;
use tracing::{debug, info};

// Client side attributes of one remote array.
#[derive(Debug)]
pub(crate) struct Entry {
    // Live handle count
    rc: u32,
    // Queued commands gating destruction beyond normal ownership
    pending: u32,
    dtype: DType,
    size: u64,
    ndim: u64,
    shape: Vec<u64>,
    itemsize: u64,
    // Producing command and its argument string
    cmd: Box<str>,
    args: Box<str>,
    // Server side storage name, when known. Differs from the identity
    // when the entry was materialized into a recycled slot.
    physical: Option<Box<str>>,
    // Created by a store variant into a previously recycled slot
    recycled: bool,
    // Memoized scalar reductions, cleared on mutation
    properties: BTreeMap<ReduceOp, Value>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

// A live id resolves to an entry with at least one owning handle.
fn is_live(slots: &[Slot], x: ArrayId) -> bool {
    slots.get(x.index() as usize).is_some_and(|slot| {
        slot.generation == x.generation() && slot.entry.as_ref().is_some_and(|e| e.rc > 0)
    })
}

/// Reply of one executed command.
#[derive(Debug)]
pub(crate) enum Response {
    Text(String),
    Bytes(Vec<u8>),
}

impl Response {
    fn text(self) -> Result<String, ArqError> {
        match self {
            Response::Text(msg) => Ok(msg),
            Response::Bytes(_) => Err(ArqError::parse_error("expected a string reply")),
        }
    }

    fn bytes(self) -> Result<Vec<u8>, ArqError> {
        match self {
            Response::Bytes(b) => Ok(b),
            Response::Text(_) => Err(ArqError::parse_error("expected a binary reply")),
        }
    }
}

fn result_dtype(op: BinOp, x: DType, y: DType) -> DType {
    if op.is_comparison() {
        DType::Bool
    } else if op.promotes_float() || x == DType::Float64 || y == DType::Float64 {
        DType::Float64
    } else {
        x
    }
}

// Cast a scalar operand to the dtype expected by the server command.
fn cast_value(value: Value, dtype: DType) -> Value {
    match dtype {
        DType::Bool => Value::Bool(value.to_f64() != 0.0),
        DType::Int64 => Value::Int64(match value {
            Value::Bool(x) => i64::from(x),
            Value::Int64(x) => x,
            Value::Float64(x) => x as i64,
        }),
        DType::Float64 => Value::Float64(value.to_f64()),
    }
}

/// Scheduler and bookkeeping state behind one [Connection](crate::Connection).
pub struct Runtime<T: Transport> {
    transport: T,
    user: String,
    token: String,
    connected: bool,
    print_threshold: u64,
    slots: Vec<Slot>,
    free: Vec<u32>,
    queue: CommandQueue,
    cache: OpCache,
    pool: SlotPool,
}

impl<T: Transport> Runtime<T> {
    pub(crate) fn new(transport: T, config: &ClientConfig, user: String, token: String) -> Self {
        Runtime {
            transport,
            user,
            token,
            connected: false,
            print_threshold: config.print_threshold,
            slots: Vec::new(),
            free: Vec::new(),
            queue: CommandQueue::new(config.queue_capacity),
            cache: OpCache::new(),
            pool: SlotPool::new(),
        }
    }

    // Direct request outside of the queue, used for the session commands.
    fn send_direct(&mut self, cmd: &str) -> Result<String, ArqError> {
        let request = RequestMessage::new(&self.user, &self.token, cmd, "", false);
        self.transport.send(&request, None)
    }

    pub(crate) fn handshake(&mut self) -> Result<(), ArqError> {
        let reply = self.send_direct("connect")?;
        self.connected = true;
        info!("{reply}");
        Ok(())
    }

    /// Drain the queue in order, then tell the server we are leaving.
    pub(crate) fn disconnect(&mut self) -> Result<(), ArqError> {
        if !self.connected {
            info!("not connected; cannot disconnect");
            return Ok(());
        }
        self.flush_all()?;
        let reply = self.send_direct("disconnect")?;
        self.connected = false;
        info!("{reply}");
        Ok(())
    }

    /// Drain the queue, then stop the remote server.
    pub(crate) fn shutdown(&mut self) -> Result<(), ArqError> {
        self.ensure_connected()?;
        self.flush_all()?;
        self.send_direct("shutdown")?;
        self.connected = false;
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> Result<(), ArqError> {
        if self.connected {
            Ok(())
        } else {
            Err(ArqError::NotConnected)
        }
    }

    // ----- entry arena -----

    fn entry(&self, x: ArrayId) -> &Entry {
        let slot = &self.slots[x.index() as usize];
        assert_eq!(slot.generation, x.generation(), "use of released array {x}");
        slot.entry.as_ref().expect("use of released array")
    }

    fn entry_mut(&mut self, x: ArrayId) -> &mut Entry {
        let slot = &mut self.slots[x.index() as usize];
        assert_eq!(slot.generation, x.generation(), "use of released array {x}");
        slot.entry.as_mut().expect("use of released array")
    }

    // Entry access that tolerates an id which already died, for paths fed
    // by queued commands rather than live handles.
    fn entry_mut_checked(&mut self, x: ArrayId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(x.index() as usize)?;
        if slot.generation != x.generation() {
            return None;
        }
        slot.entry.as_mut()
    }

    fn new_entry(
        &mut self,
        cmd: &str,
        dtype: DType,
        size: u64,
        physical: Option<Box<str>>,
        recycled: bool,
    ) -> ArrayId {
        let entry = Entry {
            rc: 1,
            pending: 0,
            dtype,
            size,
            ndim: 1,
            shape: vec![size],
            itemsize: dtype.byte_size(),
            cmd: cmd.into(),
            args: "".into(),
            physical,
            recycled,
            properties: BTreeMap::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            ArrayId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, entry: Some(entry) });
            ArrayId::new(index, 0)
        }
    }

    fn set_args(&mut self, x: ArrayId, args: &str) {
        self.entry_mut(x).args = args.into();
    }

    // Adopt an array described by a created reply, e.g. from gather or attach.
    fn adopt_created(&mut self, cmd: &str, args: String, created: Created) -> ArrayId {
        let id = self.new_entry(cmd, created.dtype, created.size, Some(created.name), false);
        let entry = self.entry_mut(id);
        entry.ndim = created.ndim;
        entry.shape = created.shape;
        entry.itemsize = created.itemsize;
        entry.args = args.into();
        id
    }

    pub(crate) fn dtype(&self, x: ArrayId) -> DType {
        self.entry(x).dtype
    }

    pub(crate) fn size(&self, x: ArrayId) -> u64 {
        self.entry(x).size
    }

    pub(crate) fn shape(&self, x: ArrayId) -> Vec<u64> {
        self.entry(x).shape.clone()
    }

    pub(crate) fn ndim(&self, x: ArrayId) -> u64 {
        self.entry(x).ndim
    }

    pub(crate) fn itemsize(&self, x: ArrayId) -> u64 {
        self.entry(x).itemsize
    }

    pub(crate) fn producing_command(&self, x: ArrayId) -> (String, String) {
        let entry = self.entry(x);
        (entry.cmd.to_string(), entry.args.to_string())
    }

    // ----- handle lifetime -----

    pub(crate) fn retain(&mut self, x: ArrayId) {
        let entry = self.entry_mut(x);
        entry.rc = entry.rc.checked_add(1).unwrap();
    }

    /// Decrease the owner count of `x`. When the last owner is gone the
    /// entry is destroyed, unless a queued command still reads the identity
    /// by name, in which case destruction rides along with that command.
    pub(crate) fn release(&mut self, x: ArrayId) {
        let Some(entry) = self.entry_mut_checked(x) else {
            return;
        };
        entry.rc = entry.rc.saturating_sub(1);
        if entry.rc > 0 {
            return;
        }
        let (dtype, size) = (entry.dtype, entry.size);
        let token = x.to_string();
        let deferred = match self.queue.find_newest_referencing(&token) {
            Some(command) => {
                debug!("deferring destruction of {x} to command {}", command.seq);
                command.carried.push((x, dtype, size));
                true
            }
            None => false,
        };
        if deferred {
            if let Some(entry) = self.entry_mut_checked(x) {
                entry.pending += 1;
            }
        } else {
            self.finalize(x, false);
        }
    }

    // Tear an entry down once nothing references it: registry entries whose
    // value is this identity go away, storage may return to the pool, and the
    // arena slot is reused under a fresh generation.
    fn finalize(&mut self, x: ArrayId, via_command: bool) {
        let Some(entry) = self.entry_mut_checked(x) else {
            return;
        };
        if via_command {
            entry.pending = entry.pending.saturating_sub(1);
        }
        if entry.pending > 0 || entry.rc > 0 {
            return;
        }
        let recycled = entry.recycled;
        let physical = entry.physical.take();
        let (dtype, size) = (entry.dtype, entry.size);
        self.cache.invalidate(x);
        if let Some(name) = physical {
            // Plainly allocated storage is only pooled when its death was
            // gated on a command, recycled slots are always pooled.
            if via_command || recycled {
                self.pool.release(dtype, size, name);
            }
        }
        let slot = &mut self.slots[x.index() as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(x.index());
        debug!("finalized {x}");
    }

    // Clear derived state that an in place mutation of `x` falsifies: the
    // memoized reductions, cached results of `x`, and cached results
    // computed from `x`.
    fn invalidate_mutation(&mut self, x: ArrayId) {
        self.entry_mut(x).properties.clear();
        self.cache.invalidate(x);
        self.cache.invalidate_operand(&x.to_string());
    }

    // ----- scheduling -----

    // Rewrite logical identity tokens to server side names just before
    // transmission. Tokens without a known physical name pass through.
    fn translate(&self, args: &str) -> String {
        args.split(' ')
            .map(|token| {
                if is_identity_token(token) {
                    if let Some(id) = ArrayId::parse_token(token) {
                        if let Some(slot) = self.slots.get(id.index() as usize) {
                            if slot.generation == id.generation() {
                                if let Some(name) =
                                    slot.entry.as_ref().and_then(|e| e.physical.as_deref())
                                {
                                    return name;
                                }
                            }
                        }
                    }
                }
                token
            })
            .collect::<Vec<&str>>()
            .join(" ")
    }

    fn submit_deferred(
        &mut self,
        cmd: &str,
        args: String,
        target: Option<ArrayId>,
        parses_created: bool,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        self.queue.enqueue(cmd, args, None, false, target, parses_created);
        self.maybe_flush_one()?;
        Ok(())
    }

    fn submit_sync(
        &mut self,
        cmd: &str,
        args: String,
        payload: Option<Vec<u8>>,
        recv_bytes: bool,
    ) -> Result<Response, ArqError> {
        self.ensure_connected()?;
        let seq = self.queue.enqueue(cmd, args, payload, recv_bytes, None, false);
        if let Some((flushed, response)) = self.maybe_flush_one()? {
            if flushed == seq {
                return Ok(response);
            }
        }
        self.execute_with_dependencies(seq)
    }

    // Capacity overflow executes exactly the oldest command. Its own
    // dependencies can only be older commands, which are gone already.
    fn maybe_flush_one(&mut self) -> Result<Option<(Seq, Response)>, ArqError> {
        if self.queue.is_at_capacity() {
            if let Some(front) = self.queue.front_seq() {
                let response = self.execute_with_dependencies(front)?;
                return Ok(Some((front, response)));
            }
        }
        Ok(None)
    }

    /// Drain the whole queue in order.
    pub(crate) fn flush_all(&mut self) -> Result<(), ArqError> {
        while let Some(front) = self.queue.front_seq() {
            self.execute_with_dependencies(front)?;
        }
        Ok(())
    }

    // Execute a queued command, still pending dependencies first,
    // depth first. Re-entry on an already executed command is a no-op.
    fn execute_with_dependencies(&mut self, seq: Seq) -> Result<Response, ArqError> {
        let Some(command) = self.queue.get(seq) else {
            return Ok(Response::Text(String::new()));
        };
        let deps = command.deps.clone();
        for dep in deps {
            if self.queue.contains(dep) {
                self.execute_with_dependencies(dep)?;
            }
        }
        let Some(command) = self.queue.remove(seq) else {
            return Ok(Response::Text(String::new()));
        };
        self.execute(command)
    }

    fn execute(&mut self, mut command: crate::queue::Command) -> Result<Response, ArqError> {
        if command.executed {
            return Ok(Response::Text(String::new()));
        }
        debug!("executing command {} {}", command.cmd, command.args);
        let args = self.translate(&command.args);
        let request = RequestMessage::new(
            &self.user,
            &self.token,
            &command.cmd,
            &args,
            command.payload.is_some(),
        );
        let response = if command.recv_bytes {
            Response::Bytes(self.transport.send_recv_bytes(&request, command.payload.as_deref())?)
        } else {
            Response::Text(self.transport.send(&request, command.payload.as_deref())?)
        };
        command.executed = true;
        if command.parses_created {
            if let Response::Text(msg) = &response {
                let created = Created::parse(msg)?;
                debug!(
                    "created server array {} {} x {}",
                    created.name, created.dtype, created.size
                );
                if let Some(target) = command.target {
                    if let Some(entry) = self.entry_mut_checked(target) {
                        entry.physical = Some(created.name);
                    }
                }
            }
        }
        for (id, _, _) in command.carried.drain(..) {
            self.finalize(id, true);
        }
        Ok(response)
    }

    // ----- operations -----

    /// Elementwise `x op y`. Probes the result cache first, then either
    /// stores into a recycled slot or allocates, deferred either way.
    pub(crate) fn binary(&mut self, op: BinOp, x: ArrayId, y: ArrayId) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let (xd, xs) = (self.entry(x).dtype, self.entry(x).size);
        let (yd, ys) = (self.entry(y).dtype, self.entry(y).size);
        if xs != ys {
            return Err(ArqError::SizeMismatch { left: xs, right: ys });
        }
        let lx = x.to_string();
        let ly = y.to_string();
        if op.is_cached() {
            let slots = &self.slots;
            if let Some(hit) = self.cache.lookup(op, &lx, &ly, |id| is_live(slots, id)) {
                debug!("cache hit for {op} {lx} {ly}");
                self.retain(hit);
                return Ok(hit);
            }
        }
        let dtype = result_dtype(op, xd, yd);
        let claimed = if op.stores_into_pool() { self.pool.claim(dtype, xs) } else { None };
        let id;
        let cmd;
        let args;
        let parses_created;
        if let Some(name) = claimed {
            cmd = "binopvvStore";
            id = self.new_entry(cmd, dtype, xs, Some(name), true);
            args = format!("{} {} {} {}", op.token(), lx, ly, id);
            parses_created = false;
        } else {
            cmd = "binopvv";
            id = self.new_entry(cmd, dtype, xs, None, false);
            args = format!("{} {} {}", op.token(), lx, ly);
            parses_created = true;
        }
        self.set_args(id, &args);
        self.cache.register(id, op, &lx, &ly);
        self.submit_deferred(cmd, args, Some(id), parses_created)?;
        Ok(id)
    }

    /// Elementwise `x op scalar`.
    pub(crate) fn binary_scalar(
        &mut self,
        op: BinOp,
        x: ArrayId,
        value: Value,
    ) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let (xd, xs) = (self.entry(x).dtype, self.entry(x).size);
        let lx = x.to_string();
        let literal = value.to_string();
        if op.is_cached() {
            let slots = &self.slots;
            if let Some(hit) = self.cache.lookup(op, &lx, &literal, |id| is_live(slots, id)) {
                debug!("cache hit for {op} {lx} {literal}");
                self.retain(hit);
                return Ok(hit);
            }
        }
        let dtype = result_dtype(op, xd, value.dtype());
        let claimed = if op.stores_into_pool() { self.pool.claim(dtype, xs) } else { None };
        let id;
        let cmd;
        let args;
        let parses_created;
        if let Some(name) = claimed {
            cmd = "binopvsStore";
            id = self.new_entry(cmd, dtype, xs, Some(name), true);
            args = format!("{} {} {} {} {}", op.token(), lx, value.dtype().name(), literal, id);
            parses_created = false;
        } else {
            cmd = "binopvs";
            id = self.new_entry(cmd, dtype, xs, None, false);
            args = format!("{} {} {} {}", op.token(), lx, value.dtype().name(), literal);
            parses_created = true;
        }
        self.set_args(id, &args);
        self.cache.register(id, op, &lx, &literal);
        self.submit_deferred(cmd, args, Some(id), parses_created)?;
        Ok(id)
    }

    /// Elementwise `scalar op x`, for the non commutative operators.
    pub(crate) fn scalar_binary(
        &mut self,
        op: BinOp,
        value: Value,
        x: ArrayId,
    ) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let (xd, xs) = (self.entry(x).dtype, self.entry(x).size);
        let lx = x.to_string();
        let literal = value.to_string();
        if op.is_cached() {
            let slots = &self.slots;
            if let Some(hit) = self.cache.lookup(op, &literal, &lx, |id| is_live(slots, id)) {
                debug!("cache hit for {op} {literal} {lx}");
                self.retain(hit);
                return Ok(hit);
            }
        }
        let dtype = result_dtype(op, xd, value.dtype());
        let claimed = if op.stores_into_pool() { self.pool.claim(dtype, xs) } else { None };
        let id;
        let cmd;
        let args;
        let parses_created;
        if let Some(name) = claimed {
            cmd = "binopsvStore";
            id = self.new_entry(cmd, dtype, xs, Some(name), true);
            args = format!("{} {} {} {} {}", op.token(), value.dtype().name(), literal, lx, id);
            parses_created = false;
        } else {
            cmd = "binopsv";
            id = self.new_entry(cmd, dtype, xs, None, false);
            args = format!("{} {} {} {}", op.token(), value.dtype().name(), literal, lx);
            parses_created = true;
        }
        self.set_args(id, &args);
        self.cache.register(id, op, &literal, &lx);
        self.submit_deferred(cmd, args, Some(id), parses_created)?;
        Ok(id)
    }

    /// In place `x op= y`, fire and forget.
    pub(crate) fn assign_array(
        &mut self,
        op: AssignOp,
        x: ArrayId,
        y: ArrayId,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        let xs = self.entry(x).size;
        let ys = self.entry(y).size;
        if xs != ys {
            return Err(ArqError::SizeMismatch { left: xs, right: ys });
        }
        self.invalidate_mutation(x);
        let args = format!("{} {} {}", op.token(), x, y);
        self.queue.enqueue("opeqvv", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// In place `x op= scalar`, fire and forget.
    pub(crate) fn assign_scalar(
        &mut self,
        op: AssignOp,
        x: ArrayId,
        value: Value,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        let dtype = self.entry(x).dtype;
        let value = cast_value(value, dtype);
        self.invalidate_mutation(x);
        let args = format!("{} {} {} {}", op.token(), x, dtype.name(), value);
        self.queue.enqueue("opeqvs", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Scalar reduction of the whole array, memoized until mutation.
    pub(crate) fn reduce(&mut self, r: ReduceOp, x: ArrayId) -> Result<Value, ArqError> {
        if let Some(value) = self.entry(x).properties.get(&r) {
            return Ok(value.clone());
        }
        let args = format!("{} {}", r.token(), x);
        let msg = self.submit_sync("reduction", args, None, false)?.text()?;
        let value = Value::parse(&msg)?;
        if let Some(entry) = self.entry_mut_checked(x) {
            entry.properties.insert(r, value.clone());
        }
        Ok(value)
    }

    /// Single element read.
    pub(crate) fn get_scalar(&mut self, x: ArrayId, index: i64) -> Result<Value, ArqError> {
        let size = self.entry(x).size;
        let normalized = normalize_index(index, size)?;
        let msg = self
            .submit_sync("[int]", format!("{x} {normalized}"), None, false)?
            .text()?;
        let rest = msg
            .split_once(' ')
            .map(|(_, rest)| rest)
            .ok_or_else(|| ArqError::parse_error(format!("malformed item reply {msg:?}")))?;
        Value::parse(rest)
    }

    /// Single element write, fire and forget.
    pub(crate) fn set_scalar(&mut self, x: ArrayId, index: i64, value: Value) -> Result<(), ArqError> {
        self.ensure_connected()?;
        let (dtype, size) = (self.entry(x).dtype, self.entry(x).size);
        let normalized = normalize_index(index, size)?;
        let value = cast_value(value, dtype);
        self.invalidate_mutation(x);
        let args = format!("{x} {normalized} {} {value}", dtype.name());
        self.queue.enqueue("[int]=val", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Extract a strided slice as a new array, deferred.
    pub(crate) fn slice(
        &mut self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
    ) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        if stride == 0 {
            return Err(ArqError::SliceError("slice stride cannot be zero".into()));
        }
        let (dtype, xsize) = (self.entry(x).dtype, self.entry(x).size);
        let (start, stop) = normalize_slice(start, stop, stride, xsize);
        let size = u64::try_from((stop - start).div_euclid(stride)).unwrap_or(0);
        let id;
        let cmd;
        let args;
        let parses_created;
        if let Some(name) = self.pool.claim(dtype, size) {
            cmd = "[sliceStore]";
            id = self.new_entry(cmd, dtype, size, Some(name), true);
            args = format!("{x} {start} {stop} {stride} {id}");
            parses_created = false;
        } else {
            cmd = "[slice]";
            id = self.new_entry(cmd, dtype, size, None, false);
            args = format!("{x} {start} {stop} {stride}");
            parses_created = true;
        }
        self.set_args(id, &args);
        self.submit_deferred(cmd, args, Some(id), parses_created)?;
        Ok(id)
    }

    /// Gather by an index or mask array, synchronous.
    pub(crate) fn gather(&mut self, x: ArrayId, index: ArrayId) -> Result<ArrayId, ArqError> {
        let xs = self.entry(x).size;
        let (kd, ks) = (self.entry(index).dtype, self.entry(index).size);
        match kd {
            DType::Int64 => {}
            DType::Bool => {
                if xs != ks {
                    return Err(ArqError::SizeMismatch { left: xs, right: ks });
                }
            }
            DType::Float64 => {
                return Err(ArqError::dtype_error("unsupported index array dtype float64"));
            }
        }
        let args = format!("{x} {index}");
        let msg = self.submit_sync("[pdarray]", args.clone(), None, false)?.text()?;
        let created = Created::parse(&msg)?;
        Ok(self.adopt_created("[pdarray]", args, created))
    }

    /// Scatter a value over masked or indexed positions, fire and forget.
    pub(crate) fn set_index_scalar(
        &mut self,
        x: ArrayId,
        index: ArrayId,
        value: Value,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        let dtype = self.entry(x).dtype;
        let value = cast_value(value, dtype);
        self.invalidate_mutation(x);
        let args = format!("{x} {index} {} {value}", dtype.name());
        self.queue.enqueue("[pdarray]=val", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Scatter an array over masked or indexed positions, fire and forget.
    pub(crate) fn set_index_array(
        &mut self,
        x: ArrayId,
        index: ArrayId,
        value: ArrayId,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        self.invalidate_mutation(x);
        let args = format!("{x} {index} {value}");
        self.queue.enqueue("[pdarray]=pdarray", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Assign a scalar over a slice, fire and forget.
    pub(crate) fn set_slice_scalar(
        &mut self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: Value,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        if stride == 0 {
            return Err(ArqError::SliceError("slice stride cannot be zero".into()));
        }
        let (dtype, size) = (self.entry(x).dtype, self.entry(x).size);
        let (start, stop) = normalize_slice(start, stop, stride, size);
        let value = cast_value(value, dtype);
        self.invalidate_mutation(x);
        let args = format!("{x} {start} {stop} {stride} {} {value}", dtype.name());
        self.queue.enqueue("[slice]=val", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Assign an array over a slice, fire and forget.
    pub(crate) fn set_slice_array(
        &mut self,
        x: ArrayId,
        start: i64,
        stop: i64,
        stride: i64,
        value: ArrayId,
    ) -> Result<(), ArqError> {
        self.ensure_connected()?;
        if stride == 0 {
            return Err(ArqError::SliceError("slice stride cannot be zero".into()));
        }
        let size = self.entry(x).size;
        let (start, stop) = normalize_slice(start, stop, stride, size);
        self.invalidate_mutation(x);
        let args = format!("{x} {start} {stop} {stride} {value}");
        self.queue.enqueue("[slice]=pdarray", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    /// Fill the whole array with one value, fire and forget.
    pub(crate) fn fill(&mut self, x: ArrayId, value: Value) -> Result<(), ArqError> {
        self.ensure_connected()?;
        let dtype = self.entry(x).dtype;
        let value = cast_value(value, dtype);
        self.invalidate_mutation(x);
        let args = format!("{x} {} {value}", dtype.name());
        self.queue.enqueue("set", args, None, false, None, false);
        self.maybe_flush_one()?;
        Ok(())
    }

    // ----- creation -----

    /// New zero filled array, deferred. Reuses a pooled slot when one fits.
    pub(crate) fn create(&mut self, dtype: DType, size: u64) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        if let Some(name) = self.pool.claim(dtype, size) {
            let id = self.new_entry("zerosStore", dtype, size, Some(name), true);
            let args = format!("{} {size} {id}", dtype.name());
            self.set_args(id, &args);
            self.submit_deferred("zerosStore", args, Some(id), false)?;
            Ok(id)
        } else {
            let id = self.new_entry("create", dtype, size, None, false);
            let args = format!("{} {size}", dtype.name());
            self.set_args(id, &args);
            self.submit_deferred("create", args, Some(id), true)?;
            Ok(id)
        }
    }

    /// Integer range, deferred.
    pub(crate) fn arange(&mut self, start: i64, stop: i64, stride: i64) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        if stride == 0 {
            return Err(ArqError::SliceError("arange stride cannot be zero".into()));
        }
        // The server expects an inclusive stop for negative strides.
        let stop = if stride < 0 { stop + 2 } else { stop };
        let size = u64::try_from((stop - start).div_euclid(stride)).unwrap_or(0);
        if let Some(name) = self.pool.claim(DType::Int64, size) {
            let id = self.new_entry("arangeStore", DType::Int64, size, Some(name), true);
            let args = format!("{start} {stop} {stride} {id}");
            self.set_args(id, &args);
            self.submit_deferred("arangeStore", args, Some(id), false)?;
            Ok(id)
        } else {
            let id = self.new_entry("arange", DType::Int64, size, None, false);
            let args = format!("{start} {stop} {stride}");
            self.set_args(id, &args);
            self.submit_deferred("arange", args, Some(id), true)?;
            Ok(id)
        }
    }

    /// Evenly spaced floats over an interval, deferred.
    pub(crate) fn linspace(&mut self, start: f64, stop: f64, length: u64) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let id = self.new_entry("linspace", DType::Float64, length, None, false);
        let args = format!("{start} {stop} {length}");
        self.set_args(id, &args);
        self.submit_deferred("linspace", args, Some(id), true)?;
        Ok(id)
    }

    /// Standard normal floats, deferred.
    pub(crate) fn random_normal(&mut self, size: u64, seed: Option<u64>) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let seed = seed.map_or("None".to_string(), |s| s.to_string());
        let id = self.new_entry("randomNormal", DType::Float64, size, None, false);
        let args = format!("{size} {seed}");
        self.set_args(id, &args);
        self.submit_deferred("randomNormal", args, Some(id), true)?;
        Ok(id)
    }

    /// Uniform random integers or floats in `[low, high)`, deferred.
    pub(crate) fn randint(
        &mut self,
        low: Value,
        high: Value,
        size: u64,
        dtype: DType,
        seed: Option<u64>,
    ) -> Result<ArrayId, ArqError> {
        self.ensure_connected()?;
        let low = cast_value(low, dtype);
        let high = cast_value(high, dtype);
        let seed = seed.map_or("None".to_string(), |s| s.to_string());
        if let Some(name) = self.pool.claim(dtype, size) {
            let id = self.new_entry("randintStore", dtype, size, Some(name), true);
            let args = format!("{size} {} {low} {high} {seed} {id}", dtype.name());
            self.set_args(id, &args);
            self.submit_deferred("randintStore", args, Some(id), false)?;
            Ok(id)
        } else {
            let id = self.new_entry("randint", dtype, size, None, false);
            let args = format!("{size} {} {low} {high} {seed}", dtype.name());
            self.set_args(id, &args);
            self.submit_deferred("randint", args, Some(id), true)?;
            Ok(id)
        }
    }

    /// Upload host data as a new server array, synchronous.
    pub(crate) fn from_slice<S: Scalar>(&mut self, data: &[S]) -> Result<ArrayId, ArqError> {
        let size = data.len() as u64;
        let mut payload = Vec::with_capacity(data.len() * S::byte_size());
        for x in data {
            x.write_le_bytes(&mut payload);
        }
        let args = format!("{} {size}", S::dtype().name());
        let msg = self.submit_sync("array", args.clone(), Some(payload), false)?.text()?;
        let created = Created::parse(&msg)?;
        Ok(self.adopt_created("array", args, created))
    }

    // ----- transfer and registration -----

    /// Download the whole array, synchronous.
    pub(crate) fn to_vec<S: Scalar>(&mut self, x: ArrayId) -> Result<Vec<S>, ArqError> {
        let (dtype, size) = (self.entry(x).dtype, self.entry(x).size);
        if dtype != S::dtype() {
            return Err(ArqError::dtype_error(format!(
                "requested {} elements from {dtype} array",
                S::dtype()
            )));
        }
        let bytes = self.submit_sync("tondarray", x.to_string(), None, true)?.bytes()?;
        let expected = size as usize * S::byte_size();
        if bytes.len() != expected {
            return Err(ArqError::parse_error(format!(
                "expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
        Ok(bytes.chunks_exact(S::byte_size()).map(S::from_le_bytes).collect())
    }

    /// Printable form of the array, value listing elided above the threshold.
    pub(crate) fn str_repr(&mut self, x: ArrayId) -> Result<String, ArqError> {
        let args = format!("{x} {}", self.print_threshold);
        self.submit_sync("str", args, None, false)?.text()
    }

    /// Pin the array in the server symbol table under a user name.
    pub(crate) fn register(&mut self, x: ArrayId, name: &str) -> Result<(), ArqError> {
        self.submit_sync("register", format!("{x} {name}"), None, false)?;
        Ok(())
    }

    /// Remove a previously registered name.
    pub(crate) fn unregister(&mut self, name: &str) -> Result<(), ArqError> {
        self.submit_sync("unregister", name.to_string(), None, false)?;
        Ok(())
    }

    /// Look up a registered name and adopt the array it points to.
    pub(crate) fn attach(&mut self, name: &str) -> Result<ArrayId, ArqError> {
        let msg = self.submit_sync("attach", name.to_string(), None, false)?.text()?;
        let created = Created::parse(&msg)?;
        Ok(self.adopt_created("attach", name.to_string(), created))
    }

    // ----- server queries -----

    /// Raw JSON runtime description of the server.
    pub(crate) fn get_config(&mut self) -> Result<String, ArqError> {
        self.submit_sync("getconfig", String::new(), None, false)?.text()
    }

    /// Bytes held by objects in the server symbol table.
    pub(crate) fn get_mem_used(&mut self) -> Result<u64, ArqError> {
        let msg = self.submit_sync("getmemused", String::new(), None, false)?.text()?;
        msg.trim()
            .parse()
            .map_err(|e| ArqError::parse_error(format!("memory reply {msg:?}, {e}")))
    }

    /// Cheap health check, "imok" when the server is reachable and sane.
    pub(crate) fn ruok(&mut self) -> String {
        match self.submit_sync("ruok", String::new(), None, false).and_then(Response::text) {
            Ok(msg) if msg == "imok" => msg,
            Ok(msg) => format!("imnotok because: {msg}"),
            Err(e) => format!("ruok did not return response: {e}"),
        }
    }

}

fn normalize_index(index: i64, size: u64) -> Result<u64, ArqError> {
    let normalized = if index < 0 { index + size as i64 } else { index };
    if normalized < 0 || normalized as u64 >= size {
        return Err(ArqError::IndexOutOfBounds { index, size });
    }
    Ok(normalized as u64)
}

// Python style slice normalization: negative bounds count from the end,
// then bounds are clamped to the array.
fn normalize_slice(start: i64, stop: i64, stride: i64, size: u64) -> (i64, i64) {
    let size = size as i64;
    let fix = |bound: i64| -> i64 {
        let bound = if bound < 0 { bound + size } else { bound };
        bound.clamp(if stride < 0 { -1 } else { 0 }, size)
    };
    (fix(start), fix(stop))
}

#[test]
fn index_normalization() {
    assert_eq!(normalize_index(3, 10).unwrap(), 3);
    assert_eq!(normalize_index(-1, 10).unwrap(), 9);
    assert!(normalize_index(10, 10).is_err());
    assert!(normalize_index(-11, 10).is_err());
}

#[test]
fn dtype_promotion() {
    assert_eq!(result_dtype(BinOp::Add, DType::Int64, DType::Int64), DType::Int64);
    assert_eq!(result_dtype(BinOp::Add, DType::Int64, DType::Float64), DType::Float64);
    assert_eq!(result_dtype(BinOp::Div, DType::Int64, DType::Int64), DType::Float64);
    assert_eq!(result_dtype(BinOp::Lt, DType::Float64, DType::Float64), DType::Bool);
}
