mod builder;
mod ffi;
mod gc;
mod loader;
mod module;
mod native;
mod opcode;
mod value;
mod vm;

pub use self::{
    builder::*, ffi::*, gc::*, loader::*, module::*, native::*, opcode::*, value::*, vm::*,
};
