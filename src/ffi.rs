use std::collections::HashMap;

use libloading::Library;
use tracing::warn;

use crate::value::Value;

/// Signature tags supported by `CALL_FFI`. Each names a fixed C calling
/// shape; anything else falls back to Nil at the call site.
pub const SIG_I32_I32_TO_I32: u8 = 0;
pub const SIG_I32_TO_I32: u8 = 1;
pub const SIG_F64_F64_TO_F64: u8 = 2;

/// Dynamic-library cache for `CALL_FFI`. Libraries are opened on first use
/// and stay open for the life of the VM instance.
#[derive(Default)]
pub struct FfiCache {
    libs: HashMap<String, Library>,
}

impl FfiCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn library(&mut self, path: &str) -> Option<&Library> {
        if !self.libs.contains_key(path) {
            // SAFETY: loading a library runs its initializers; the host has
            // asked for exactly that by emitting CALL_FFI against this path.
            match unsafe { Library::new(path) } {
                Ok(lib) => {
                    self.libs.insert(path.to_string(), lib);
                }
                Err(err) => {
                    warn!("ffi: failed to open library '{}': {}", path, err);
                    return None;
                }
            }
        }
        self.libs.get(path)
    }

    /// Resolve `symbol` in `path` and call it with the shape named by `sig`.
    /// Returns None when the library, symbol, or signature/argc combination
    /// is unusable; the interpreter maps that to Nil.
    pub fn call(&mut self, path: &str, symbol: &str, sig: u8, args: &[Value]) -> Option<Value> {
        let lib = self.library(path)?;
        match (sig, args.len()) {
            (SIG_I32_I32_TO_I32, 2) => {
                // SAFETY: the signature tag is the caller's declaration of
                // the symbol's true type; a wrong declaration is undefined
                // behavior by the FFI contract.
                let f: libloading::Symbol<unsafe extern "C" fn(i32, i32) -> i32> =
                    match unsafe { lib.get(symbol.as_bytes()) } {
                        Ok(f) => f,
                        Err(err) => {
                            warn!("ffi: symbol '{}' missing in '{}': {}", symbol, path, err);
                            return None;
                        }
                    };
                let result = unsafe { f(int_arg(args[0]), int_arg(args[1])) };
                Some(Value::Int(result as i64))
            }
            (SIG_I32_TO_I32, 1) => {
                let f: libloading::Symbol<unsafe extern "C" fn(i32) -> i32> =
                    match unsafe { lib.get(symbol.as_bytes()) } {
                        Ok(f) => f,
                        Err(err) => {
                            warn!("ffi: symbol '{}' missing in '{}': {}", symbol, path, err);
                            return None;
                        }
                    };
                let result = unsafe { f(int_arg(args[0])) };
                Some(Value::Int(result as i64))
            }
            (SIG_F64_F64_TO_F64, 2) => {
                let f: libloading::Symbol<unsafe extern "C" fn(f64, f64) -> f64> =
                    match unsafe { lib.get(symbol.as_bytes()) } {
                        Ok(f) => f,
                        Err(err) => {
                            warn!("ffi: symbol '{}' missing in '{}': {}", symbol, path, err);
                            return None;
                        }
                    };
                let result = unsafe { f(double_arg(args[0]), double_arg(args[1])) };
                Some(Value::Double(result))
            }
            (sig, argc) => {
                warn!("ffi: unsupported signature {} with {} arguments", sig, argc);
                None
            }
        }
    }
}

fn int_arg(value: Value) -> i32 {
    match value {
        Value::Int(v) => v as i32,
        _ => 0,
    }
}

fn double_arg(value: Value) -> f64 {
    match value {
        Value::Double(v) => v,
        Value::Int(v) => v as f64,
        _ => 0.0,
    }
}
