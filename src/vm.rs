use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{bail, Result};
use tracing::{error, warn};

use crate::ffi::FfiCache;
use crate::gc::Heap;
use crate::loader::{self, LoadError};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::value::{HeapObject, Value};

/// A host-provided callable. By contract it pops exactly `argc` values and
/// pushes exactly one result (Nil on failure).
pub type NativeFn = Rc<dyn Fn(&mut Vm, u8)>;

/// An in-progress invocation. `local_base` is the operand-stack index where
/// this frame's local slot 0 lives; arguments already on the stack become
/// the low local slots in place.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub function: u32,
    pub ip: usize,
    pub local_base: usize,
}

/// The Droplet virtual machine: one operand stack shared by every frame, a
/// call-frame stack, globals, the GC-managed heap, and the native/FFI
/// registries. All state is instance-level; two VMs share nothing.
pub struct Vm {
    stack: Vec<Value>,
    sp: usize,
    frames: Vec<Frame>,
    pub globals: HashMap<String, Value>,
    pub heap: Heap,
    natives: HashMap<String, NativeFn>,
    module: Module,
    ffi: FfiCache,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            sp: 0,
            frames: Vec::new(),
            globals: HashMap::new(),
            heap: Heap::new(),
            natives: HashMap::new(),
            module: Module::default(),
            ffi: FfiCache::new(),
        }
    }

    /// Parse a `.dbc` image and install it as this VM's module. String
    /// constants are interned on the heap and rooted by the constant pool.
    pub fn load_module(&mut self, bytes: &[u8]) -> std::result::Result<(), LoadError> {
        match loader::load_module(bytes, &mut self.heap) {
            Ok(module) => {
                self.module = module;
                Ok(())
            }
            Err(err) => {
                error!("module rejected: {}", err);
                Err(err)
            }
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn register_native(&mut self, name: &str, native: impl Fn(&mut Vm, u8) + 'static) {
        self.natives.insert(name.to_string(), Rc::new(native));
    }

    /// Locate `entry`, push a zero-argument frame for it, and interpret
    /// until the frame stack drains. The exit status is the numeric form of
    /// whatever the entry function left on top of the stack.
    pub fn run(&mut self, entry: &str) -> Result<i32> {
        let Some(index) = self.module.lookup(entry) else {
            bail!("entry function '{}' not found", entry);
        };
        self.push_call_frame(index, 0);
        self.interpret()?;
        Ok(self.exit_status())
    }

    fn exit_status(&self) -> i32 {
        match self.peek(0) {
            Value::Int(v) => v as i32,
            Value::Double(v) => v as i32,
            _ => 0,
        }
    }

    // Stack ops. Frames share this one stack; `sp` is the live top. Popping
    // an empty stack yields Nil rather than aborting.

    pub fn push(&mut self, value: Value) {
        if self.sp >= self.stack.len() {
            self.stack.push(value);
        } else {
            self.stack[self.sp] = value;
        }
        self.sp += 1;
    }

    pub fn pop(&mut self) -> Value {
        if self.sp == 0 {
            return Value::Nil;
        }
        self.sp -= 1;
        self.stack[self.sp]
    }

    pub fn peek(&self, position: usize) -> Value {
        if position >= self.sp {
            return Value::Nil;
        }
        self.stack[self.sp - 1 - position]
    }

    pub fn stack_top(&self) -> Value {
        self.peek(0)
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    fn drop_args(&mut self, argc: u8) {
        for _ in 0..argc {
            self.pop();
        }
    }

    /// Push a frame for `function` whose arguments are the top `argc` stack
    /// values. They become locals 0..argc in place; remaining local slots
    /// are initialized to Nil. Hosts and natives may call this to schedule
    /// a script function.
    pub fn push_call_frame(&mut self, function: u32, argc: u8) {
        let Some(callee) = self.module.function(function) else {
            warn!("call: bad function index {}", function);
            self.drop_args(argc);
            self.push(Value::Nil);
            return;
        };
        let local_count = callee.local_count;
        let local_base = self.sp.saturating_sub(argc as usize);
        for _ in argc..local_count {
            self.push(Value::Nil);
        }
        self.frames.push(Frame {
            function,
            ip: 0,
            local_base,
        });
    }

    /// Pop `count` return values, discard the frame and its locals, and
    /// re-push the returns in order for the caller.
    fn do_return(&mut self, count: u8) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let mut returns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            returns.push(self.pop());
        }
        self.sp = frame.local_base.min(self.sp);
        self.stack.truncate(self.sp);
        for value in returns.into_iter().rev() {
            self.push(value);
        }
    }

    /// Force a collection with the current roots: the live stack region,
    /// the globals, and the constant pool.
    pub fn collect_now(&mut self) {
        let sp = self.sp;
        let Vm {
            heap,
            stack,
            globals,
            module,
            ..
        } = self;
        let roots = stack[..sp]
            .iter()
            .copied()
            .chain(globals.values().copied())
            .chain(module.constants().iter().copied());
        heap.collect(roots);
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    // Instruction fetch against the current frame. Reads past the end of a
    // function body yield zero; the loop's end-of-code check fires first
    // for well-formed code.

    fn fetch_u8(&mut self) -> u8 {
        let Some(frame) = self.frames.last_mut() else {
            return 0;
        };
        let Some(function) = self.module.function(frame.function) else {
            return 0;
        };
        let byte = function.code.get(frame.ip).copied().unwrap_or(0);
        frame.ip += 1;
        byte
    }

    fn fetch_u32(&mut self) -> u32 {
        let Some(frame) = self.frames.last_mut() else {
            return 0;
        };
        let Some(function) = self.module.function(frame.function) else {
            return 0;
        };
        let value = function
            .code
            .get(frame.ip..frame.ip + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        frame.ip += 4;
        value
    }

    fn constant_string(&self, index: u32) -> Option<String> {
        match self.module.constant(index)? {
            Value::Object(id) => self.heap.string(id).map(str::to_string),
            _ => None,
        }
    }

    fn display(&self, value: Value) -> String {
        value.display(&self.heap)
    }

    /// Fetch-decode-execute until the frame stack is empty. Run-time
    /// anomalies fall back to Nil/0/false and keep going; only an unknown
    /// opcode stops the loop (stack left intact).
    pub fn interpret(&mut self) -> Result<()> {
        while !self.frames.is_empty() {
            if self.heap.should_collect() {
                self.collect_now();
            }

            let frame = *self.current_frame();
            let code_len = self
                .module
                .function(frame.function)
                .map(|f| f.code.len())
                .unwrap_or(0);
            if frame.ip >= code_len {
                self.do_return(0);
                continue;
            }

            let byte = self.fetch_u8();
            let Some(op) = Opcode::from_u8(byte) else {
                bail!(
                    "unknown opcode 0x{:02X} at offset {} in function {}",
                    byte,
                    frame.ip,
                    frame.function
                );
            };

            match op {
                Opcode::PushConst => {
                    let index = self.fetch_u32();
                    match self.module.constant(index) {
                        Some(value) => self.push(value),
                        None => {
                            warn!("push_const: constant {} out of range", index);
                            self.push(Value::Nil);
                        }
                    }
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let value = self.peek(0);
                    self.push(value);
                }
                Opcode::Swap => {
                    let a = self.pop();
                    let b = self.pop();
                    self.push(a);
                    self.push(b);
                }
                Opcode::Rot => {
                    let a = self.pop();
                    let b = self.pop();
                    let c = self.pop();
                    self.push(b);
                    self.push(a);
                    self.push(c);
                }

                Opcode::LoadLocal => {
                    let slot = self.fetch_u8() as usize;
                    let abs = self.current_frame().local_base + slot;
                    let value = if abs < self.sp {
                        self.stack[abs]
                    } else {
                        Value::Nil
                    };
                    self.push(value);
                }
                Opcode::StoreLocal => {
                    let slot = self.fetch_u8() as usize;
                    let abs = self.current_frame().local_base + slot;
                    let value = self.pop();
                    while self.sp <= abs {
                        self.push(Value::Nil);
                    }
                    self.stack[abs] = value;
                }
                Opcode::LoadGlobal => {
                    let index = self.fetch_u32();
                    match self.constant_string(index) {
                        Some(name) => {
                            let value = self.globals.get(&name).copied().unwrap_or(Value::Nil);
                            self.push(value);
                        }
                        None => {
                            warn!("load_global: constant {} is not a string", index);
                            self.push(Value::Nil);
                        }
                    }
                }
                Opcode::StoreGlobal => {
                    let index = self.fetch_u32();
                    let value = self.pop();
                    match self.constant_string(index) {
                        Some(name) => {
                            self.globals.insert(name, value);
                        }
                        None => warn!("store_global: constant {} is not a string", index),
                    }
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    self.execute_arithmetic(op);
                }

                Opcode::And => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Opcode::Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }

                Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Gt | Opcode::Lte | Opcode::Gte => {
                    self.execute_comparison(op);
                }

                Opcode::Jump => {
                    let target = self.fetch_u32() as usize;
                    self.current_frame_mut().ip = target;
                }
                Opcode::JumpIfFalse => {
                    let target = self.fetch_u32() as usize;
                    let condition = self.pop();
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }
                Opcode::JumpIfTrue => {
                    let target = self.fetch_u32() as usize;
                    let condition = self.pop();
                    if condition.is_truthy() {
                        self.current_frame_mut().ip = target;
                    }
                }

                Opcode::Call => {
                    let function = self.fetch_u32();
                    let argc = self.fetch_u8();
                    self.push_call_frame(function, argc);
                }
                Opcode::Return => {
                    let count = self.fetch_u8();
                    self.do_return(count);
                }
                Opcode::CallNative => {
                    let name_idx = self.fetch_u32();
                    let argc = self.fetch_u8();
                    match self.constant_string(name_idx) {
                        Some(name) => match self.natives.get(&name).cloned() {
                            Some(native) => (*native)(self, argc),
                            None => {
                                warn!("call_native: unknown native '{}'", name);
                                self.drop_args(argc);
                                self.push(Value::Nil);
                            }
                        },
                        None => {
                            warn!("call_native: constant {} is not a string", name_idx);
                            self.drop_args(argc);
                            self.push(Value::Nil);
                        }
                    }
                }
                Opcode::CallFfi => {
                    let lib_idx = self.fetch_u32();
                    let sym_idx = self.fetch_u32();
                    let argc = self.fetch_u8();
                    let sig = self.fetch_u8();
                    match (self.constant_string(lib_idx), self.constant_string(sym_idx)) {
                        (Some(lib), Some(symbol)) => {
                            let mut args = vec![Value::Nil; argc as usize];
                            for slot in args.iter_mut().rev() {
                                *slot = self.pop();
                            }
                            let result = self
                                .ffi
                                .call(&lib, &symbol, sig, &args)
                                .unwrap_or(Value::Nil);
                            self.push(result);
                        }
                        _ => {
                            warn!("call_ffi: library/symbol constants are not strings");
                            self.drop_args(argc);
                            self.push(Value::Nil);
                        }
                    }
                }

                Opcode::NewObject => {
                    let name_idx = self.fetch_u32();
                    if self.module.constant(name_idx).is_none() {
                        warn!("new_object: constant {} out of range", name_idx);
                        self.push(Value::Nil);
                    } else {
                        let class_name = self
                            .constant_string(name_idx)
                            .unwrap_or_else(|| "Object".to_string());
                        let id = self.heap.alloc_instance(class_name);
                        self.push(Value::Object(id));
                    }
                }
                Opcode::GetField => {
                    let name_idx = self.fetch_u32();
                    let object = self.pop();
                    let result = match (self.constant_string(name_idx), object) {
                        (Some(name), Value::Object(id)) => match self.heap.get(id) {
                            Some(HeapObject::Instance(instance)) => {
                                instance.fields.get(&name).copied().unwrap_or(Value::Nil)
                            }
                            _ => {
                                warn!("get_field: receiver is not an instance");
                                Value::Nil
                            }
                        },
                        (None, _) => {
                            warn!("get_field: constant {} is not a string", name_idx);
                            Value::Nil
                        }
                        _ => {
                            warn!("get_field: receiver is not an object");
                            Value::Nil
                        }
                    };
                    self.push(result);
                }
                Opcode::SetField => {
                    let name_idx = self.fetch_u32();
                    let value = self.pop();
                    let object = self.pop();
                    match (self.constant_string(name_idx), object) {
                        (Some(name), Value::Object(id)) => match self.heap.get_mut(id) {
                            Some(HeapObject::Instance(instance)) => {
                                instance.fields.insert(name, value);
                            }
                            _ => warn!("set_field: receiver is not an instance"),
                        },
                        (None, _) => {
                            warn!("set_field: constant {} is not a string", name_idx)
                        }
                        _ => warn!("set_field: receiver is not an object"),
                    }
                }
                Opcode::IsInstance => {
                    let type_idx = self.fetch_u32();
                    let value = self.pop();
                    let result = match (self.constant_string(type_idx), value) {
                        (Some(type_name), Value::Object(id)) => matches!(
                            self.heap.get(id),
                            Some(HeapObject::Instance(instance))
                                if instance.class_name == type_name
                        ),
                        _ => false,
                    };
                    self.push(Value::Bool(result));
                }

                Opcode::NewArray => {
                    let id = self.heap.alloc_array();
                    self.push(Value::Object(id));
                }
                Opcode::ArrayGet => {
                    let index = self.pop();
                    let array = self.pop();
                    let result = match array {
                        Value::Object(id) => match self.heap.get(id) {
                            Some(HeapObject::Array(elements)) => {
                                let i = index.as_index();
                                if i < 0 || i as usize >= elements.len() {
                                    Value::Nil
                                } else {
                                    elements[i as usize]
                                }
                            }
                            _ => {
                                warn!("array_get: receiver is not an array");
                                Value::Nil
                            }
                        },
                        _ => {
                            warn!("array_get: receiver is not an array");
                            Value::Nil
                        }
                    };
                    self.push(result);
                }
                Opcode::ArraySet => {
                    let value = self.pop();
                    let index = self.pop();
                    let array = self.pop();
                    let i = index.as_index();
                    match array {
                        Value::Object(id) => match self.heap.get_mut(id) {
                            Some(HeapObject::Array(elements)) => {
                                if i < 0 {
                                    warn!("array_set: negative index {}", i);
                                } else {
                                    let i = i as usize;
                                    if i >= elements.len() {
                                        elements.resize(i + 1, Value::Nil);
                                    }
                                    elements[i] = value;
                                }
                            }
                            _ => warn!("array_set: receiver is not an array"),
                        },
                        _ => warn!("array_set: receiver is not an array"),
                    }
                }
                Opcode::NewMap => {
                    let id = self.heap.alloc_map();
                    self.push(Value::Object(id));
                }
                Opcode::MapGet => {
                    let key = self.pop();
                    let map = self.pop();
                    let key = self.display(key);
                    let result = match map {
                        Value::Object(id) => match self.heap.get(id) {
                            Some(HeapObject::Map(entries)) => {
                                entries.get(&key).copied().unwrap_or(Value::Nil)
                            }
                            _ => {
                                warn!("map_get: receiver is not a map");
                                Value::Nil
                            }
                        },
                        _ => {
                            warn!("map_get: receiver is not a map");
                            Value::Nil
                        }
                    };
                    self.push(result);
                }
                Opcode::MapSet => {
                    let value = self.pop();
                    let key = self.pop();
                    let map = self.pop();
                    let key = self.display(key);
                    match map {
                        Value::Object(id) => match self.heap.get_mut(id) {
                            Some(HeapObject::Map(entries)) => {
                                entries.insert(key, value);
                            }
                            _ => warn!("map_set: receiver is not a map"),
                        },
                        _ => warn!("map_set: receiver is not a map"),
                    }
                }

                Opcode::StringConcat => {
                    let b = self.pop();
                    let a = self.pop();
                    let combined = format!("{}{}", self.display(a), self.display(b));
                    let id = self.heap.alloc_string(combined);
                    self.push(Value::Object(id));
                }
                Opcode::StringLength => {
                    let value = self.pop();
                    let length = match value {
                        Value::Object(id) => self.heap.string(id).map(|s| s.len() as i64),
                        _ => None,
                    };
                    let length = length.unwrap_or_else(|| {
                        warn!("string_length: operand is not a string");
                        0
                    });
                    self.push(Value::Int(length));
                }
                Opcode::StringSubstr => {
                    let start = self.fetch_u32() as usize;
                    let len = self.fetch_u32() as usize;
                    let value = self.pop();
                    let sliced = match value {
                        Value::Object(id) => self.heap.string(id).map(|s| {
                            let bytes = s.as_bytes();
                            let start = start.min(bytes.len());
                            let len = len.min(bytes.len() - start);
                            String::from_utf8_lossy(&bytes[start..start + len]).into_owned()
                        }),
                        _ => None,
                    };
                    let out = sliced.unwrap_or_else(|| {
                        warn!("string_substr: operand is not a string");
                        String::new()
                    });
                    let id = self.heap.alloc_string(out);
                    self.push(Value::Object(id));
                }
                Opcode::StringEq => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = self.display(a) == self.display(b);
                    self.push(Value::Bool(equal));
                }
                Opcode::StringGetChar => {
                    let index = self.pop();
                    let value = self.pop();
                    let i = index.as_index();
                    let ch = match value {
                        Value::Object(id) => self.heap.string(id).and_then(|s| {
                            let bytes = s.as_bytes();
                            if i >= 0 && (i as usize) < bytes.len() {
                                let at = i as usize;
                                Some(String::from_utf8_lossy(&bytes[at..at + 1]).into_owned())
                            } else {
                                None
                            }
                        }),
                        _ => None,
                    };
                    let id = self.heap.alloc_string(ch.unwrap_or_default());
                    self.push(Value::Object(id));
                }
            }
        }
        Ok(())
    }

    /// Pop `b` then `a`, coerce, push the result. Two Ints stay integral
    /// except under DIV, which always produces a Double (so zero divisors
    /// follow IEEE-754 instead of trapping); MOD with a zero Int divisor is
    /// promoted the same way.
    fn execute_arithmetic(&mut self, op: Opcode) {
        let b = self.pop();
        let a = self.pop();
        if !a.is_numeric() || !b.is_numeric() {
            warn!("arithmetic: non-numeric operand treated as 0");
        }
        if let (Value::Int(x), Value::Int(y)) = (a, b) {
            if op != Opcode::Div && !(op == Opcode::Mod && y == 0) {
                let result = match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mul => x.wrapping_mul(y),
                    Opcode::Mod => x.wrapping_rem(y),
                    _ => unreachable!("not an integer arithmetic opcode"),
                };
                self.push(Value::Int(result));
                return;
            }
        }
        let x = a.as_number();
        let y = b.as_number();
        let result = match op {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => x / y,
            Opcode::Mod => x % y,
            _ => unreachable!("not an arithmetic opcode"),
        };
        self.push(Value::Double(result));
    }

    /// Numeric pairs compare as Doubles, string pairs lexicographically,
    /// other object pairs by identity (orderings are false), and anything
    /// else is equal only when type and textual form both match.
    fn execute_comparison(&mut self, op: Opcode) {
        let b = self.pop();
        let a = self.pop();
        let result = if a.is_numeric() && b.is_numeric() {
            let x = a.as_number();
            let y = b.as_number();
            match op {
                Opcode::Eq => x == y,
                Opcode::Neq => x != y,
                Opcode::Lt => x < y,
                Opcode::Gt => x > y,
                Opcode::Lte => x <= y,
                Opcode::Gte => x >= y,
                _ => false,
            }
        } else if let (Value::Object(x), Value::Object(y)) = (a, b) {
            match (self.heap.string(x), self.heap.string(y)) {
                (Some(sa), Some(sb)) => match op {
                    Opcode::Eq => sa == sb,
                    Opcode::Neq => sa != sb,
                    Opcode::Lt => sa < sb,
                    Opcode::Gt => sa > sb,
                    Opcode::Lte => sa <= sb,
                    Opcode::Gte => sa >= sb,
                    _ => false,
                },
                _ => match op {
                    Opcode::Eq => x == y,
                    Opcode::Neq => x != y,
                    _ => false,
                },
            }
        } else {
            let same_type = std::mem::discriminant(&a) == std::mem::discriminant(&b);
            let textual_match = same_type && self.display(a) == self.display(b);
            match op {
                Opcode::Eq => textual_match,
                Opcode::Neq => !textual_match,
                _ => false,
            }
        };
        self.push(Value::Bool(result));
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
