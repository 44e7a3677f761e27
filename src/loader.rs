use thiserror::Error;
use tracing::debug;

use crate::gc::Heap;
use crate::module::{Function, Module};
use crate::value::Value;

pub const DBC_MAGIC: [u8; 4] = *b"DLBC";
pub const DBC_VERSION: u8 = 1;

/// Why a `.dbc` image was rejected. No [`Module`] is produced on any of
/// these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("bytecode truncated at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("bad magic, expected \"DLBC\"")]
    BadMagic,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown type tag {tag} for constant {index}")]
    UnknownConstantTag { index: u32, tag: u8 },
    #[error("function {index}: name constant {name_idx} is not a string")]
    FunctionNameNotString { index: u32, name_idx: u32 },
    #[error("function {index}: code range {start}+{size} exceeds code section of {total} bytes")]
    CodeOutOfBounds {
        index: u32,
        start: u32,
        size: u32,
        total: u32,
    },
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], LoadError> {
        let Some(slice) = self.bytes.get(self.offset..self.offset + count) else {
            return Err(LoadError::UnexpectedEof {
                offset: self.offset,
                needed: self.offset + count - self.bytes.len(),
            });
        };
        self.offset += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, LoadError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, LoadError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

struct FunctionHeader {
    name_idx: u32,
    start: u32,
    size: u32,
    arg_count: u8,
    local_count: u8,
}

/// Parse a `.dbc` image into a [`Module`], interning string constants on
/// `heap` so they participate in normal reachability from the constant pool.
pub fn load_module(bytes: &[u8], heap: &mut Heap) -> Result<Module, LoadError> {
    let mut reader = Reader::new(bytes);

    if reader.take(4)? != DBC_MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version = reader.read_u8()?;
    if version != DBC_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let const_count = reader.read_u32()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for index in 0..const_count {
        let tag = reader.read_u8()?;
        let value = match tag {
            1 => Value::Int(reader.read_i32()? as i64),
            2 => Value::Double(reader.read_f64()?),
            3 => {
                let len = reader.read_u32()? as usize;
                let raw = reader.take(len)?;
                let id = heap.alloc_string(String::from_utf8_lossy(raw).into_owned());
                Value::Object(id)
            }
            4 => Value::Nil,
            5 => Value::Bool(reader.read_u8()? != 0),
            tag => return Err(LoadError::UnknownConstantTag { index, tag }),
        };
        constants.push(value);
    }

    let fn_count = reader.read_u32()?;
    let mut headers = Vec::with_capacity(fn_count as usize);
    for _ in 0..fn_count {
        headers.push(FunctionHeader {
            name_idx: reader.read_u32()?,
            start: reader.read_u32()?,
            size: reader.read_u32()?,
            arg_count: reader.read_u8()?,
            local_count: reader.read_u8()?,
        });
    }

    let code_size = reader.read_u32()?;
    let code = reader.take(code_size as usize)?;

    let mut functions = Vec::with_capacity(fn_count as usize);
    for (index, header) in headers.iter().enumerate() {
        let name = constants
            .get(header.name_idx as usize)
            .and_then(|value| match value {
                Value::Object(id) => heap.string(*id),
                _ => None,
            })
            .ok_or(LoadError::FunctionNameNotString {
                index: index as u32,
                name_idx: header.name_idx,
            })?
            .to_string();

        let end = header.start as u64 + header.size as u64;
        if end > code_size as u64 {
            return Err(LoadError::CodeOutOfBounds {
                index: index as u32,
                start: header.start,
                size: header.size,
                total: code_size,
            });
        }

        functions.push(Function {
            name,
            code: code[header.start as usize..end as usize].to_vec(),
            arg_count: header.arg_count,
            local_count: header.local_count,
        });
    }

    debug!(
        functions = fn_count,
        constants = const_count,
        code_bytes = code_size,
        "loaded module"
    );
    Ok(Module::new(constants, functions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DbcBuilder;

    #[test]
    fn test_rejects_bad_magic() {
        let mut heap = Heap::new();
        let err = load_module(b"XXXX\x01\x00\x00\x00\x00", &mut heap).unwrap_err();
        assert_eq!(err, LoadError::BadMagic);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut heap = Heap::new();
        let err = load_module(b"DLBC\x02\x00\x00\x00\x00", &mut heap).unwrap_err();
        assert_eq!(err, LoadError::UnsupportedVersion(2));
    }

    #[test]
    fn test_rejects_truncated_image() {
        let mut heap = Heap::new();
        let err = load_module(b"DLBC", &mut heap).unwrap_err();
        assert!(matches!(err, LoadError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_rejects_unknown_constant_tag() {
        let mut bytes = b"DLBC\x01".to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(9);
        let mut heap = Heap::new();
        let err = load_module(&bytes, &mut heap).unwrap_err();
        assert_eq!(err, LoadError::UnknownConstantTag { index: 0, tag: 9 });
    }

    #[test]
    fn test_rejects_non_string_function_name() {
        let mut builder = DbcBuilder::new();
        let name = builder.add_int(7);
        builder.add_raw_function(name, 0, 0, vec![]);
        let mut heap = Heap::new();
        let err = load_module(&builder.finish(), &mut heap).unwrap_err();
        assert_eq!(
            err,
            LoadError::FunctionNameNotString {
                index: 0,
                name_idx: name,
            }
        );
    }

    #[test]
    fn test_rejects_code_out_of_bounds() {
        let mut builder = DbcBuilder::new();
        let name = builder.add_string("main");
        builder.add_raw_function(name, 0, 0, vec![0x02; 8]);
        let mut bytes = builder.finish();
        // Shrink the declared code section below what the header claims.
        let code_size_at = bytes.len() - 8 - 4;
        bytes[code_size_at..code_size_at + 4].copy_from_slice(&4u32.to_le_bytes());
        bytes.truncate(code_size_at + 4 + 4);
        let mut heap = Heap::new();
        let err = load_module(&bytes, &mut heap).unwrap_err();
        assert!(matches!(err, LoadError::CodeOutOfBounds { .. }));
    }

    #[test]
    fn test_loads_all_constant_kinds() {
        let mut builder = DbcBuilder::new();
        let i = builder.add_int(-12);
        let d = builder.add_double(2.5);
        let s = builder.add_string("hi");
        let n = builder.add_nil();
        let b = builder.add_bool(true);
        let mut heap = Heap::new();
        let module = load_module(&builder.finish(), &mut heap).unwrap();
        assert_eq!(module.constant(i), Some(Value::Int(-12)));
        assert_eq!(module.constant(d), Some(Value::Double(2.5)));
        assert_eq!(module.constant(n), Some(Value::Nil));
        assert_eq!(module.constant(b), Some(Value::Bool(true)));
        let Some(Value::Object(id)) = module.constant(s) else {
            panic!("string constant should be a heap object");
        };
        assert_eq!(heap.string(id), Some("hi"));
    }

    #[test]
    fn test_round_trip_preserves_module_shape() {
        let mut builder = DbcBuilder::new();
        builder.add_function("main", 0, 2, vec![]);
        builder.add_function("helper", 2, 3, vec![0x02]);
        let mut heap = Heap::new();
        let module = load_module(&builder.finish(), &mut heap).unwrap();
        assert_eq!(module.functions().len(), 2);
        assert_eq!(module.lookup("main"), Some(0));
        assert_eq!(module.lookup("helper"), Some(1));
        let helper = module.function(1).unwrap();
        assert_eq!(helper.arg_count, 2);
        assert_eq!(helper.local_count, 3);
        assert_eq!(helper.code, vec![0x02]);
    }
}
