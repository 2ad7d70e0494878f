//! Scheduler behavior tests against an in memory fake server.
//!
//! The fake implements just enough of the command set to observe ordering,
//! caching and recycling decisions from the outside: every executed command
//! lands in a log, and arrays hold real values so results can be checked.

use arq::{ArqError, BinOp, ClientConfig, Connection, DType, RequestMessage, Transport, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Clone, Debug)]
struct Symbol {
    dtype: String,
    data: Vec<f64>,
}

impl Symbol {
    fn itemsize(&self) -> u64 {
        if self.dtype == "bool" {
            1
        } else {
            8
        }
    }
}

#[derive(Default)]
struct FakeServer {
    symbols: BTreeMap<String, Symbol>,
    registered: BTreeMap<String, String>,
    next: u32,
    // Every executed non session command, in execution order
    log: Vec<(String, String)>,
    // Commands with this name fail with a server error
    fail_on: Option<String>,
}

fn apply(op: &str, a: f64, b: f64) -> f64 {
    match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "//" => (a / b).floor(),
        "%" => a - b * (a / b).floor(),
        "**" => a.powf(b),
        "<<" => ((a as i64) << (b as i64)) as f64,
        ">>" => ((a as i64) >> (b as i64)) as f64,
        "&" => ((a as i64) & (b as i64)) as f64,
        "|" => ((a as i64) | (b as i64)) as f64,
        "^" => ((a as i64) ^ (b as i64)) as f64,
        "<" => f64::from(a < b),
        ">" => f64::from(a > b),
        "<=" => f64::from(a <= b),
        ">=" => f64::from(a >= b),
        "==" => f64::from(a == b),
        "!=" => f64::from(a != b),
        _ => panic!("fake server: unknown operator {op}"),
    }
}

fn binop_dtype(op: &str, a: &str, b: &str) -> String {
    if matches!(op, "<" | ">" | "<=" | ">=" | "==" | "!=") {
        "bool".into()
    } else if op == "/" || a == "float64" || b == "float64" {
        "float64".into()
    } else {
        a.into()
    }
}

fn parse_literal(dtype: &str, literal: &str) -> f64 {
    match dtype {
        "bool" => f64::from(literal == "true"),
        _ => literal.parse().unwrap(),
    }
}

fn format_scalar(dtype: &str, value: f64) -> String {
    match dtype {
        "bool" => format!("bool {}", if value != 0.0 { "true" } else { "false" }),
        "int64" => format!("int64 {}", value as i64),
        _ => format!("float64 {value}"),
    }
}

impl FakeServer {
    fn alloc(&mut self, dtype: &str, data: Vec<f64>) -> String {
        self.next += 1;
        let name = format!("sv_{}", self.next);
        self.symbols.insert(name.clone(), Symbol { dtype: dtype.into(), data });
        name
    }

    fn created(&self, name: &str) -> String {
        let s = &self.symbols[name];
        format!("created {name} {} {} 1 [{}] {}", s.dtype, s.data.len(), s.data.len(), s.itemsize())
    }

    fn sym(&self, name: &str) -> Symbol {
        assert!(
            !name.starts_with("id_"),
            "untranslated identity token {name} reached the server"
        );
        self.symbols
            .get(name)
            .unwrap_or_else(|| panic!("fake server: undefined symbol {name}"))
            .clone()
    }

    fn store(&mut self, name: &str, dtype: String, data: Vec<f64>) {
        assert!(self.symbols.contains_key(name), "store into unknown slot {name}");
        self.symbols.insert(name.into(), Symbol { dtype, data });
    }

    fn handle(&mut self, cmd: &str, args: &str, payload: Option<&[u8]>) -> Result<String, ArqError> {
        match cmd {
            "connect" => return Ok("connected to fake server".into()),
            "disconnect" => return Ok("disconnected".into()),
            "shutdown" => return Ok(String::new()),
            _ => {}
        }
        if self.fail_on.as_deref() == Some(cmd) {
            return Err(ArqError::ServerError(format!("injected failure in {cmd}").into()));
        }
        self.log.push((cmd.into(), args.into()));
        let t: Vec<&str> = args.split(' ').collect();
        Ok(match cmd {
            "create" => {
                let size: usize = t[1].parse().unwrap();
                let name = self.alloc(t[0], vec![0.0; size]);
                self.created(&name)
            }
            "zerosStore" => {
                let size: usize = t[1].parse().unwrap();
                self.store(t[2], t[0].into(), vec![0.0; size]);
                "stored".into()
            }
            "set" => {
                let value = parse_literal(t[1], t[2]);
                let mut s = self.sym(t[0]);
                s.data.iter_mut().for_each(|x| *x = value);
                self.symbols.insert(t[0].into(), s);
                "set".into()
            }
            "arange" | "arangeStore" => {
                let (start, stop, stride): (i64, i64, i64) =
                    (t[0].parse().unwrap(), t[1].parse().unwrap(), t[2].parse().unwrap());
                let count = ((stop - start).div_euclid(stride)).max(0);
                let data: Vec<f64> = (0..count).map(|i| (start + i * stride) as f64).collect();
                if cmd == "arangeStore" {
                    self.store(t[3], "int64".into(), data);
                    "stored".into()
                } else {
                    let name = self.alloc("int64", data);
                    self.created(&name)
                }
            }
            "linspace" => {
                let (start, stop): (f64, f64) = (t[0].parse().unwrap(), t[1].parse().unwrap());
                let length: usize = t[2].parse().unwrap();
                let step = if length > 1 { (stop - start) / (length - 1) as f64 } else { 0.0 };
                let data = (0..length).map(|i| start + step * i as f64).collect();
                let name = self.alloc("float64", data);
                self.created(&name)
            }
            "randint" | "randintStore" => {
                let size: usize = t[0].parse().unwrap();
                let low = parse_literal(t[1], t[2]);
                let data = vec![low; size];
                if cmd == "randintStore" {
                    self.store(t[5], t[1].into(), data);
                    "stored".into()
                } else {
                    let name = self.alloc(t[1], data);
                    self.created(&name)
                }
            }
            "randomNormal" => {
                let size: usize = t[0].parse().unwrap();
                let name = self.alloc("float64", vec![0.0; size]);
                self.created(&name)
            }
            "binopvv" | "binopvvStore" => {
                let (a, b) = (self.sym(t[1]), self.sym(t[2]));
                let dtype = binop_dtype(t[0], &a.dtype, &b.dtype);
                let data: Vec<f64> =
                    a.data.iter().zip(&b.data).map(|(x, y)| apply(t[0], *x, *y)).collect();
                if cmd == "binopvvStore" {
                    self.store(t[3], dtype, data);
                    "stored".into()
                } else {
                    let name = self.alloc(&dtype, data);
                    self.created(&name)
                }
            }
            "binopvs" | "binopvsStore" => {
                let a = self.sym(t[1]);
                let value = parse_literal(t[2], t[3]);
                let dtype = binop_dtype(t[0], &a.dtype, t[2]);
                let data: Vec<f64> = a.data.iter().map(|x| apply(t[0], *x, value)).collect();
                if cmd == "binopvsStore" {
                    self.store(t[4], dtype, data);
                    "stored".into()
                } else {
                    let name = self.alloc(&dtype, data);
                    self.created(&name)
                }
            }
            "binopsv" | "binopsvStore" => {
                let value = parse_literal(t[1], t[2]);
                let a = self.sym(t[3]);
                let dtype = binop_dtype(t[0], t[1], &a.dtype);
                let data: Vec<f64> = a.data.iter().map(|x| apply(t[0], value, *x)).collect();
                if cmd == "binopsvStore" {
                    self.store(t[4], dtype, data);
                    "stored".into()
                } else {
                    let name = self.alloc(&dtype, data);
                    self.created(&name)
                }
            }
            "opeqvv" => {
                let op = &t[0][..t[0].len() - 1];
                let (mut a, b) = (self.sym(t[1]), self.sym(t[2]));
                a.data.iter_mut().zip(&b.data).for_each(|(x, y)| *x = apply(op, *x, *y));
                self.symbols.insert(t[1].into(), a);
                "updated".into()
            }
            "opeqvs" => {
                let op = &t[0][..t[0].len() - 1];
                let value = parse_literal(t[2], t[3]);
                let mut a = self.sym(t[1]);
                a.data.iter_mut().for_each(|x| *x = apply(op, *x, value));
                self.symbols.insert(t[1].into(), a);
                "updated".into()
            }
            "reduction" => {
                let s = self.sym(t[1]);
                match t[0] {
                    "sum" => {
                        let total: f64 = s.data.iter().sum();
                        let dtype = if s.dtype == "float64" { "float64" } else { "int64" };
                        format_scalar(dtype, total)
                    }
                    "prod" => {
                        let total: f64 = s.data.iter().product();
                        let dtype = if s.dtype == "float64" { "float64" } else { "int64" };
                        format_scalar(dtype, total)
                    }
                    "min" => format_scalar(&s.dtype, s.data.iter().cloned().fold(f64::INFINITY, f64::min)),
                    "max" => {
                        format_scalar(&s.dtype, s.data.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
                    }
                    "argmin" => {
                        let (i, _) = s
                            .data
                            .iter()
                            .enumerate()
                            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                            .unwrap();
                        format_scalar("int64", i as f64)
                    }
                    "argmax" => {
                        let (i, _) = s
                            .data
                            .iter()
                            .enumerate()
                            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                            .unwrap();
                        format_scalar("int64", i as f64)
                    }
                    "any" => format_scalar("bool", f64::from(s.data.iter().any(|x| *x != 0.0))),
                    "all" => format_scalar("bool", f64::from(s.data.iter().all(|x| *x != 0.0))),
                    "is_sorted" => {
                        format_scalar("bool", f64::from(s.data.windows(2).all(|w| w[0] <= w[1])))
                    }
                    other => panic!("fake server: unknown reduction {other}"),
                }
            }
            "[int]" => {
                let s = self.sym(t[0]);
                let index: usize = t[1].parse().unwrap();
                format!("item {}", format_scalar(&s.dtype, s.data[index]))
            }
            "[int]=val" => {
                let index: usize = t[1].parse().unwrap();
                let value = parse_literal(t[2], t[3]);
                let mut s = self.sym(t[0]);
                s.data[index] = value;
                self.symbols.insert(t[0].into(), s);
                "updated".into()
            }
            "[slice]" | "[sliceStore]" => {
                let s = self.sym(t[0]);
                let (start, stop, stride): (i64, i64, i64) =
                    (t[1].parse().unwrap(), t[2].parse().unwrap(), t[3].parse().unwrap());
                let count = ((stop - start).div_euclid(stride)).max(0);
                let data: Vec<f64> =
                    (0..count).map(|i| s.data[(start + i * stride) as usize]).collect();
                if cmd == "[sliceStore]" {
                    self.store(t[4], s.dtype, data);
                    "stored".into()
                } else {
                    let name = self.alloc(&s.dtype.clone(), data);
                    self.created(&name)
                }
            }
            "[slice]=val" => {
                let (start, stop, stride): (i64, i64, i64) =
                    (t[1].parse().unwrap(), t[2].parse().unwrap(), t[3].parse().unwrap());
                let value = parse_literal(t[4], t[5]);
                let mut s = self.sym(t[0]);
                let mut i = start;
                while i < stop {
                    s.data[i as usize] = value;
                    i += stride;
                }
                self.symbols.insert(t[0].into(), s);
                "updated".into()
            }
            "[slice]=pdarray" => {
                let (start, _stop, stride): (i64, i64, i64) =
                    (t[1].parse().unwrap(), t[2].parse().unwrap(), t[3].parse().unwrap());
                let v = self.sym(t[4]);
                let mut s = self.sym(t[0]);
                for (k, value) in v.data.iter().enumerate() {
                    s.data[(start + k as i64 * stride) as usize] = *value;
                }
                self.symbols.insert(t[0].into(), s);
                "updated".into()
            }
            "[pdarray]" => {
                let s = self.sym(t[0]);
                let idx = self.sym(t[1]);
                let data: Vec<f64> = if idx.dtype == "bool" {
                    s.data.iter().zip(&idx.data).filter(|(_, m)| **m != 0.0).map(|(x, _)| *x).collect()
                } else {
                    idx.data.iter().map(|i| s.data[*i as usize]).collect()
                };
                let name = self.alloc(&s.dtype.clone(), data);
                self.created(&name)
            }
            "[pdarray]=val" => {
                let idx = self.sym(t[1]);
                let value = parse_literal(t[2], t[3]);
                let mut s = self.sym(t[0]);
                if idx.dtype == "bool" {
                    for (x, m) in s.data.iter_mut().zip(&idx.data) {
                        if *m != 0.0 {
                            *x = value;
                        }
                    }
                } else {
                    for i in &idx.data {
                        s.data[*i as usize] = value;
                    }
                }
                self.symbols.insert(t[0].into(), s);
                "updated".into()
            }
            "[pdarray]=pdarray" => {
                let idx = self.sym(t[1]);
                let v = self.sym(t[2]);
                let mut s = self.sym(t[0]);
                for (k, i) in idx.data.iter().enumerate() {
                    s.data[*i as usize] = v.data[k];
                }
                self.symbols.insert(t[0].into(), s);
                "updated".into()
            }
            "str" => {
                let s = self.sym(t[0]);
                let values: Vec<String> = s.data.iter().map(|x| format!("{x}")).collect();
                format!("array([{}])", values.join(", "))
            }
            "array" => {
                let size: usize = t[1].parse().unwrap();
                let bytes = payload.expect("array command without payload");
                let data: Vec<f64> = match t[0] {
                    "int64" => bytes
                        .chunks_exact(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()) as f64)
                        .collect(),
                    "float64" => bytes
                        .chunks_exact(8)
                        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                        .collect(),
                    _ => bytes.iter().map(|b| f64::from(*b != 0)).collect(),
                };
                assert_eq!(data.len(), size);
                let name = self.alloc(t[0], data);
                self.created(&name)
            }
            "register" => {
                self.sym(t[0]);
                self.registered.insert(t[1].into(), t[0].into());
                "success".into()
            }
            "attach" => {
                let name = self.registered[t[0]].clone();
                self.created(&name)
            }
            "unregister" => {
                self.registered.remove(t[0]);
                "success".into()
            }
            "getconfig" => r#"{"serverHostname":"fake","numLocales":1}"#.into(),
            "getmemused" => {
                let total: u64 = self.symbols.values().map(|s| s.data.len() as u64 * s.itemsize()).sum();
                format!("{total}")
            }
            "ruok" => "imok".into(),
            other => panic!("fake server: unknown command {other}"),
        })
    }
}

#[derive(Clone)]
struct FakeTransport(Rc<RefCell<FakeServer>>);

impl Transport for FakeTransport {
    fn send(&mut self, request: &RequestMessage, payload: Option<&[u8]>) -> Result<String, ArqError> {
        self.0.borrow_mut().handle(&request.cmd, &request.args, payload)
    }

    fn send_recv_bytes(
        &mut self,
        request: &RequestMessage,
        _payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, ArqError> {
        assert_eq!(&request.cmd[..], "tondarray");
        let mut server = self.0.borrow_mut();
        server.log.push((request.cmd.clone(), request.args.clone()));
        let s = server.sym(request.args.trim());
        let mut bytes = Vec::new();
        for x in &s.data {
            match s.dtype.as_str() {
                "int64" => bytes.extend_from_slice(&(*x as i64).to_le_bytes()),
                "float64" => bytes.extend_from_slice(&x.to_le_bytes()),
                _ => bytes.push(u8::from(*x != 0.0)),
            }
        }
        Ok(bytes)
    }
}

fn connect(capacity: usize) -> (Connection<FakeTransport>, Rc<RefCell<FakeServer>>) {
    let server = Rc::new(RefCell::new(FakeServer::default()));
    let config = ClientConfig { queue_capacity: capacity, ..ClientConfig::default() };
    let conn = Connection::with_transport(FakeTransport(server.clone()), &config, "").unwrap();
    (conn, server)
}

fn log_len(server: &Rc<RefCell<FakeServer>>) -> usize {
    server.borrow().log.len()
}

fn commands(server: &Rc<RefCell<FakeServer>>) -> Vec<String> {
    server.borrow().log.iter().map(|(cmd, _)| cmd.clone()).collect()
}

#[test]
fn repeated_binop_hits_the_cache_with_zero_remote_calls() {
    let (conn, server) = connect(8);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[4i64, 5, 6]).unwrap();
    let sent = log_len(&server);
    let s1 = &a + &b;
    let s2 = &a + &b;
    let s3 = &b + &a;
    assert_eq!(s1.id(), s2.id());
    assert_eq!(s1.id(), s3.id());
    // One command queued, nothing sent, and flushing sends it exactly once.
    assert_eq!(log_len(&server), sent);
    conn.flush().unwrap();
    assert_eq!(log_len(&server), sent + 1);
    // Subtraction is not commutative, the swapped ordering is a different result.
    let d1 = &a - &b;
    let d2 = &b - &a;
    assert_ne!(d1.id(), d2.id());
    assert_eq!(d1.to_vec::<i64>().unwrap(), [-3, -3, -3]);
    assert_eq!(d2.to_vec::<i64>().unwrap(), [3, 3, 3]);
}

#[test]
fn scalar_operands_participate_in_the_cache() {
    let (conn, _server) = connect(8);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let s1 = &a * 3i64;
    let s2 = &a * 3i64;
    let s3 = 3i64 * &a;
    assert_eq!(s1.id(), s2.id());
    assert_eq!(s1.id(), s3.id());
    let s4 = &a * 4i64;
    assert_ne!(s1.id(), s4.id());
    assert_eq!(s1.to_vec::<i64>().unwrap(), [3, 6, 9]);
}

#[test]
fn queue_overflow_executes_exactly_the_oldest_command() {
    let (conn, server) = connect(2);
    let _x = conn.zeros(10, DType::Int64).unwrap();
    assert_eq!(log_len(&server), 0);
    let _y = conn.zeros(20, DType::Int64).unwrap();
    assert_eq!(log_len(&server), 1);
    let _z = conn.zeros(30, DType::Int64).unwrap();
    assert_eq!(log_len(&server), 2);
    let log = server.borrow().log.clone();
    assert_eq!(log[0], ("create".to_string(), "int64 10".to_string()));
    assert_eq!(log[1], ("create".to_string(), "int64 20".to_string()));
}

#[test]
fn sync_request_forces_queued_dependencies_first() {
    let (conn, server) = connect(2);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[10i64, 20, 30]).unwrap();
    let t1 = &a + &b;
    let total = t1.sum().unwrap();
    assert_eq!(total, Value::Int64(66));
    let cmds = commands(&server);
    assert_eq!(&cmds[cmds.len() - 2..], ["binopvv", "reduction"]);
    // The scalar is memoized, asking again is free.
    let sent = log_len(&server);
    assert_eq!(t1.sum().unwrap(), Value::Int64(66));
    assert_eq!(log_len(&server), sent);
}

#[test]
fn deferred_destruction_recycles_storage_after_the_command_runs() {
    let (conn, server) = connect(10);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[4i64, 5, 6]).unwrap();
    let t = &a + &b;
    let u = &t + &a;
    let t_id = t.id();
    // A queued command still reads t by name, so dropping it must not
    // reclaim anything until that command has run.
    drop(t);
    conn.flush().unwrap();
    assert_eq!(u.to_vec::<i64>().unwrap(), [6, 9, 12]);
    // t ran as sv_3 and its storage went back to the pool when u executed,
    // so a matching allocation now stores into sv_3 instead of allocating.
    let c = conn.zeros(3, DType::Int64).unwrap();
    conn.flush().unwrap();
    let last = server.borrow().log.last().cloned().unwrap();
    assert_eq!(last.0, "zerosStore");
    assert!(last.1.ends_with("sv_3"), "expected reuse of sv_3, got {:?}", last);
    assert_eq!(c.to_vec::<i64>().unwrap(), [0, 0, 0]);
    assert_ne!(c.id(), t_id);
    // The cached a+b result died with t, the same expression is a fresh command.
    let t2 = &a + &b;
    assert_ne!(t2.id(), t_id);
}

#[test]
fn matching_binop_stores_into_the_recycled_slot() {
    let (conn, server) = connect(10);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[4i64, 5, 6]).unwrap();
    {
        let r = &a + &b;
        let _s = &r + &a;
    }
    // Both r and s are gone; r's death rode on s's command, so its slot
    // sv_3 is idle in the pool now.
    conn.flush().unwrap();
    let m = &a * &b;
    conn.flush().unwrap();
    let last = server.borrow().log.last().cloned().unwrap();
    assert_eq!(last.0, "binopvvStore");
    assert!(last.1.ends_with("sv_3"), "expected store into sv_3, got {:?}", last);
    assert_eq!(m.to_vec::<i64>().unwrap(), [4, 10, 18]);
}

#[test]
fn flush_failures_surface_on_the_triggering_call() {
    let (conn, server) = connect(2);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[4i64, 5, 6]).unwrap();
    let _c = a.binary(BinOp::Add, &b).unwrap();
    server.borrow_mut().fail_on = Some("binopvv".into());
    // The unrelated enqueue fills the queue; the forced flush of the add
    // fails and the failure is attributed to this call.
    let result = conn.zeros(10, DType::Int64);
    assert!(matches!(result, Err(ArqError::ServerError(_))));
    server.borrow_mut().fail_on = None;
}

#[test]
fn in_place_mutation_runs_before_dependent_reads_and_invalidates_caches() {
    let (conn, _server) = connect(4);
    let a = conn.array(&[1i64, 2, 3]).unwrap();
    let b = conn.array(&[10i64, 20, 30]).unwrap();
    let s1 = &a + &b;
    assert_eq!(s1.sum().unwrap(), Value::Int64(66));
    let mut a2 = a.clone();
    a2 += 5i64;
    // The queued += must execute before the reduction reads a.
    assert_eq!(a.sum().unwrap(), Value::Int64(21));
    // Mutating a falsified the cached a+b, the expression recomputes.
    let s2 = &a + &b;
    assert_ne!(s2.id(), s1.id());
    assert_eq!(s2.sum().unwrap(), Value::Int64(81));
    // s1 itself was not mutated, its memoized sum stays valid.
    assert_eq!(s1.sum().unwrap(), Value::Int64(66));
}

#[test]
fn indexing_slicing_and_transfer() {
    let (conn, _server) = connect(2);
    let x = conn.arange(0, 10, 1).unwrap();
    assert_eq!(x.get(-1).unwrap(), Value::Int64(9));
    assert!(matches!(x.get(10), Err(ArqError::IndexOutOfBounds { .. })));
    let s = x.slice(2, 8, 2).unwrap();
    assert_eq!(s.size(), 3);
    assert_eq!(s.to_vec::<i64>().unwrap(), [2, 4, 6]);
    x.set(0, 100i64).unwrap();
    assert_eq!(x.get(0).unwrap(), Value::Int64(100));
    assert!(matches!(x.to_vec::<f64>(), Err(ArqError::DTypeError(_))));
    assert!(format!("{x}").starts_with("array(["));
}

#[test]
fn slice_assignment_goes_through_the_queue() {
    let (conn, _server) = connect(4);
    let x = conn.zeros(6, DType::Int64).unwrap();
    x.set_slice(0, 6, 2, 7i64).unwrap();
    let v = conn.array(&[1i64, 2, 3]).unwrap();
    x.set_slice_array(1, 6, 2, &v).unwrap();
    assert_eq!(x.to_vec::<i64>().unwrap(), [7, 1, 7, 2, 7, 3]);
}

#[test]
fn gather_and_scatter() {
    let (conn, _server) = connect(4);
    let x = conn.array(&[10i64, 20, 30, 40]).unwrap();
    let idx = conn.array(&[0i64, 2]).unwrap();
    let g = x.gather(&idx).unwrap();
    assert_eq!(g.to_vec::<i64>().unwrap(), [10, 30]);
    let mask = x.binary_value(BinOp::Gt, 15i64).unwrap();
    assert_eq!(mask.dtype(), DType::Bool);
    let m = x.gather(&mask).unwrap();
    assert_eq!(m.to_vec::<i64>().unwrap(), [20, 30, 40]);
    x.set_index(&idx, 0i64).unwrap();
    assert_eq!(x.to_vec::<i64>().unwrap(), [0, 20, 0, 40]);
}

#[test]
fn reductions() {
    let (conn, _server) = connect(4);
    let x = conn.array(&[1.5f64, 2.5, 3.0]).unwrap();
    assert_eq!(x.sum().unwrap(), Value::Float64(7.0));
    assert_eq!(x.min().unwrap(), Value::Float64(1.5));
    assert_eq!(x.argmax().unwrap(), 2);
    assert!(x.is_sorted().unwrap());
    assert!((x.mean().unwrap() - 7.0 / 3.0).abs() < 1e-12);
    let expected_var = (1.5f64 * 1.5 + 2.5 * 2.5 + 9.0) / 3.0 - (7.0f64 / 3.0).powi(2);
    assert!((x.var().unwrap() - expected_var).abs() < 1e-12);
    let y = conn.array(&[4i64, 1, 3]).unwrap();
    assert!(!y.is_sorted().unwrap());
    assert_eq!(y.argmin().unwrap(), 1);
    assert!(y.any().unwrap());
    assert!(y.all().unwrap());
}

#[test]
fn promotion_and_float_division() {
    let (conn, _server) = connect(4);
    let x = conn.array(&[1i64, 2, 4]).unwrap();
    let d = &x / 2i64;
    assert_eq!(d.dtype(), DType::Float64);
    assert_eq!(d.to_vec::<f64>().unwrap(), [0.5, 1.0, 2.0]);
    let f = x.floordiv_value(2i64).unwrap();
    assert_eq!(f.dtype(), DType::Int64);
    assert_eq!(f.to_vec::<i64>().unwrap(), [0, 1, 2]);
    let p = x.pow_value(2i64).unwrap();
    assert_eq!(p.to_vec::<i64>().unwrap(), [1, 4, 16]);
    let n = -&x;
    assert_eq!(n.to_vec::<i64>().unwrap(), [-1, -2, -4]);
}

#[test]
fn register_and_attach() {
    let (conn, _server) = connect(2);
    let x = conn.array(&[7i64, 8]).unwrap();
    x.register("mine").unwrap();
    let y = conn.attach("mine").unwrap();
    assert_eq!(y.to_vec::<i64>().unwrap(), [7, 8]);
    conn.unregister("mine").unwrap();
}

#[test]
fn server_queries() {
    let (conn, _server) = connect(2);
    let _x = conn.array(&[1i64, 2, 3]).unwrap();
    assert!(conn.get_config().unwrap().contains("serverHostname"));
    assert_eq!(conn.get_mem_used().unwrap(), 24);
    assert_eq!(conn.ruok(), "imok");
}

#[test]
fn operations_after_disconnect_error_out() {
    let (conn, _server) = connect(2);
    let x = conn.array(&[1i64]).unwrap();
    conn.disconnect().unwrap();
    assert!(!conn.is_connected());
    assert!(matches!(conn.zeros(5, DType::Int64), Err(ArqError::NotConnected)));
    assert!(matches!(x.sum(), Err(ArqError::NotConnected)));
}

#[test]
fn randomized_deferred_ops_match_a_local_model() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    let (conn, _server) = connect(2);
    let mut rng = SmallRng::seed_from_u64(69420);
    let mut arrays = Vec::new();
    for _ in 0..3 {
        let data: Vec<i64> = (0..8).map(|_| rng.gen_range(-20..20)).collect();
        arrays.push((conn.array(&data).unwrap(), data));
    }
    for _ in 0..40 {
        let i = rng.gen_range(0..arrays.len());
        let j = rng.gen_range(0..arrays.len());
        let op = if rng.gen_bool(0.5) { BinOp::Add } else { BinOp::Sub };
        let result = arrays[i].0.binary(op, &arrays[j].0).unwrap();
        let expected: Vec<i64> = arrays[i]
            .1
            .iter()
            .zip(&arrays[j].1)
            .map(|(x, y)| if op == BinOp::Add { x + y } else { x - y })
            .collect();
        arrays.push((result, expected));
        // Random drops exercise deferred destruction and slot recycling
        // while commands are still queued.
        if arrays.len() > 6 {
            let victim = rng.gen_range(0..arrays.len());
            arrays.remove(victim);
        }
    }
    for (array, expected) in &arrays {
        assert_eq!(&array.to_vec::<i64>().unwrap(), expected);
    }
}
