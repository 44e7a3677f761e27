use std::io::{self, BufRead, Write};

use crate::value::{HeapObject, Value};
use crate::vm::Vm;

/// Install the standard host functions scripts expect: `print`, `println`,
/// `str`, `len`, `int`, `float`, `input`, `exit`.
pub fn register_default_natives(vm: &mut Vm) {
    vm.register_native("print", native_print);
    vm.register_native("println", native_println);
    vm.register_native("str", native_str);
    vm.register_native("len", native_len);
    vm.register_native("int", native_int);
    vm.register_native("float", native_float);
    vm.register_native("input", native_input);
    vm.register_native("exit", native_exit);
}

fn joined_args(vm: &Vm, argc: u8) -> String {
    let mut pieces = Vec::with_capacity(argc as usize);
    for position in (0..argc).rev() {
        pieces.push(vm.peek(position as usize).display(&vm.heap));
    }
    pieces.join(" ")
}

fn native_print(vm: &mut Vm, argc: u8) {
    print!("{}", joined_args(vm, argc));
    for _ in 0..argc {
        vm.pop();
    }
    vm.push(Value::Nil);
}

fn native_println(vm: &mut Vm, argc: u8) {
    println!("{}", joined_args(vm, argc));
    for _ in 0..argc {
        vm.pop();
    }
    vm.push(Value::Nil);
}

fn native_str(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Nil);
        return;
    }
    let value = vm.pop();
    let text = value.display(&vm.heap);
    let id = vm.heap.alloc_string(text);
    vm.push(Value::Object(id));
}

fn native_len(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Int(0));
        return;
    }
    let value = vm.pop();
    let length = match value {
        Value::Object(id) => match vm.heap.get(id) {
            Some(HeapObject::Array(elements)) => elements.len() as i64,
            Some(HeapObject::Map(entries)) => entries.len() as i64,
            Some(HeapObject::Str(s)) => s.len() as i64,
            _ => 0,
        },
        _ => 0,
    };
    vm.push(Value::Int(length));
}

fn native_int(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Int(0));
        return;
    }
    let value = vm.pop();
    let result = match value {
        Value::Int(v) => v,
        Value::Double(v) => v as i64,
        _ => value.display(&vm.heap).trim().parse().unwrap_or(0),
    };
    vm.push(Value::Int(result));
}

fn native_float(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Double(0.0));
        return;
    }
    let value = vm.pop();
    let result = match value {
        Value::Int(v) => v as f64,
        Value::Double(v) => v,
        _ => value.display(&vm.heap).trim().parse().unwrap_or(0.0),
    };
    vm.push(Value::Double(result));
}

fn native_input(vm: &mut Vm, argc: u8) {
    if argc == 1 {
        let prompt = vm.pop();
        print!("{}", prompt.display(&vm.heap));
        let _ = io::stdout().flush();
    } else if argc > 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Nil);
        return;
    }
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        vm.push(Value::Nil);
        return;
    }
    let line = line.trim_end_matches(['\n', '\r']);
    let id = vm.heap.alloc_string(line);
    vm.push(Value::Object(id));
}

fn native_exit(vm: &mut Vm, argc: u8) {
    if argc != 1 {
        for _ in 0..argc {
            vm.pop();
        }
        vm.push(Value::Nil);
        return;
    }
    let value = vm.pop();
    let code = match value {
        Value::Int(v) => v as i32,
        Value::Double(v) => v as i32,
        _ => value.display(&vm.heap).trim().parse().unwrap_or(1),
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_stringifies_top_of_stack() {
        let mut vm = Vm::new();
        vm.push(Value::Int(42));
        native_str(&mut vm, 1);
        let Value::Object(id) = vm.stack_top() else {
            panic!("expected string object");
        };
        assert_eq!(vm.heap.string(id), Some("42"));
        assert_eq!(vm.sp(), 1);
    }

    #[test]
    fn test_str_wrong_argc_pushes_nil() {
        let mut vm = Vm::new();
        vm.push(Value::Int(1));
        vm.push(Value::Int(2));
        native_str(&mut vm, 2);
        assert_eq!(vm.stack_top(), Value::Nil);
        assert_eq!(vm.sp(), 1);
    }

    #[test]
    fn test_len_of_collections() {
        let mut vm = Vm::new();
        let array = vm.heap.alloc(HeapObject::Array(vec![Value::Int(1), Value::Int(2)]));
        vm.push(Value::Object(array));
        native_len(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(2));

        let s = vm.heap.alloc_string("abcd");
        vm.push(Value::Object(s));
        native_len(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(4));

        vm.push(Value::Int(5));
        native_len(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(0));
    }

    #[test]
    fn test_int_parses_strings() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_string(" 123 ");
        vm.push(Value::Object(s));
        native_int(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(123));

        let bad = vm.heap.alloc_string("abc");
        vm.push(Value::Object(bad));
        native_int(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(0));

        vm.push(Value::Double(3.9));
        native_int(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Int(3));
    }

    #[test]
    fn test_float_parses_strings() {
        let mut vm = Vm::new();
        let s = vm.heap.alloc_string("2.5");
        vm.push(Value::Object(s));
        native_float(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Double(2.5));

        vm.push(Value::Int(4));
        native_float(&mut vm, 1);
        assert_eq!(vm.pop(), Value::Double(4.0));
    }

    #[test]
    fn test_registry_installs_all_defaults() {
        let mut vm = Vm::new();
        register_default_natives(&mut vm);
        // Drive one installed native through the normal dispatch path.
        use crate::builder::{CodeBuilder, DbcBuilder};
        let mut b = DbcBuilder::new();
        let name = b.add_string("len");
        let s = b.add_string("four");
        let code = CodeBuilder::new()
            .push_const(s)
            .call_native(name, 1)
            .ret(1)
            .into_bytes();
        b.add_function("main", 0, 0, code);
        vm.load_module(&b.finish()).unwrap();
        let status = vm.run("main").unwrap();
        assert_eq!(status, 4);
    }
}
