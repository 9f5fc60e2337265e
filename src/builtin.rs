//! Host-function registration for the standard library surface a fresh
//! `Vm` carries out of the box. Grounded on `examples/original_source/
//! builtins.go`'s `loadMath`/`loadFmt`/`loadStrings`/`loadOs`/`loadBuiltin`
//! family: one `load_xxx(&mut Vm)` per pseudo-package, each registering
//! `"pkg.Name"`-qualified globals via `Vm::func`/`Vm::set`.

use crate::error::PanicError;
use crate::value::{Value, TYPE_STRING, TYPE_UINT8};
use crate::vm::Vm;

/// Registers every builtin pseudo-package onto `vm`. Called once by
/// `Vm::new` (spec.md §6.2, "the standard environment").
pub fn install(vm: &mut Vm) {
    load_builtin(vm);
    load_math(vm);
    load_fmt(vm);
    load_strings(vm);
    load_strconv(vm);
    load_os(vm);
}

fn arg1f(vm: &mut Vm) -> f64 {
    let a = vm.take_args(1);
    a[0].as_f64()
}

fn arg2f(vm: &mut Vm) -> (f64, f64) {
    let a = vm.take_args(2);
    (a[0].as_f64(), a[1].as_f64())
}

fn load_math(vm: &mut Vm) {
    vm.func("math.Abs", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.abs()));
        Ok(())
    });
    vm.func("math.Ceil", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.ceil()));
        Ok(())
    });
    vm.func("math.Floor", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.floor()));
        Ok(())
    });
    vm.func("math.Round", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.round()));
        Ok(())
    });
    vm.func("math.Sqrt", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.sqrt()));
        Ok(())
    });
    vm.func("math.Sin", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.sin()));
        Ok(())
    });
    vm.func("math.Cos", 1, 1, |vm| {
        let a = arg1f(vm);
        vm.push_result(Value::float64(a.cos()));
        Ok(())
    });
    vm.func("math.Pow", 2, 1, |vm| {
        let (a, b) = arg2f(vm);
        vm.push_result(Value::float64(a.powf(b)));
        Ok(())
    });
    vm.func("math.Mod", 2, 1, |vm| {
        let (a, b) = arg2f(vm);
        vm.push_result(Value::float64(a % b));
        Ok(())
    });
    vm.func("math.Max", 2, 1, |vm| {
        let (a, b) = arg2f(vm);
        vm.push_result(Value::float64(a.max(b)));
        Ok(())
    });
    vm.func("math.Min", 2, 1, |vm| {
        let (a, b) = arg2f(vm);
        vm.push_result(Value::float64(a.min(b)));
        Ok(())
    });
    vm.set("math.Pi", Value::float64(std::f64::consts::PI));
}

fn sprint(vals: &[Value]) -> String {
    vals.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn load_fmt(vm: &mut Vm) {
    vm.func("fmt.Sprint", 0, 1, |vm| {
        let n = vm.stack_len();
        let args = vm.take_args(n);
        vm.push_result(Value::string(sprint(&args)));
        Ok(())
    });
    vm.func("fmt.Print", 0, 0, |vm| {
        let n = vm.stack_len();
        let args = vm.take_args(n);
        vm.write_stdout(&sprint(&args));
        Ok(())
    });
    vm.func("fmt.Println", 0, 0, |vm| {
        let n = vm.stack_len();
        let args = vm.take_args(n);
        vm.write_stdout(&sprint(&args));
        vm.write_stdout("\n");
        Ok(())
    });
}

fn load_strings(vm: &mut Vm) {
    vm.func("strings.Split", 2, 1, |vm| {
        let a = vm.take_args(2);
        let parts: Vec<Value> = a[0]
            .as_str()
            .split(a[1].as_str())
            .map(Value::string)
            .collect();
        vm.push_result(Value::new_slice(TYPE_STRING, parts));
        Ok(())
    });
    vm.func("strings.Join", 2, 1, |vm| {
        let a = vm.take_args(2);
        let parts: Vec<String> = a[0].slice_values().iter().map(|v| v.as_str().to_string()).collect();
        vm.push_result(Value::string(parts.join(a[1].as_str())));
        Ok(())
    });
    vm.func("strings.Contains", 2, 1, |vm| {
        let a = vm.take_args(2);
        vm.push_result(Value::bool_(a[0].as_str().contains(a[1].as_str())));
        Ok(())
    });
    vm.func("strings.Repeat", 2, 1, |vm| {
        let a = vm.take_args(2);
        vm.push_result(Value::string(a[0].as_str().repeat(a[1].as_int().max(0) as usize)));
        Ok(())
    });
    vm.func("strings.ReplaceAll", 3, 1, |vm| {
        let a = vm.take_args(3);
        vm.push_result(Value::string(
            a[0].as_str().replace(a[1].as_str(), a[2].as_str()),
        ));
        Ok(())
    });
    vm.func("strings.TrimSuffix", 2, 1, |vm| {
        let a = vm.take_args(2);
        let s = a[0].as_str().strip_suffix(a[1].as_str()).unwrap_or(a[0].as_str());
        vm.push_result(Value::string(s.to_string()));
        Ok(())
    });
}

fn load_strconv(vm: &mut Vm) {
    vm.func("strconv.Itoa", 1, 1, |vm| {
        let a = vm.take_args(1);
        vm.push_result(Value::string(a[0].as_int().to_string()));
        Ok(())
    });
    vm.func("strconv.ParseFloat", 1, 1, |vm| {
        let a = vm.take_args(1);
        let s = a[0].as_str();
        let parsed: f64 = s
            .parse()
            .map_err(|_| PanicError::new(crate::token::Position::NONE, "CALL", format!("invalid float: {s:?}")))?;
        vm.push_result(Value::float64(parsed));
        Ok(())
    });
}

fn load_os(vm: &mut Vm) {
    let args: Vec<Value> = std::env::args().map(Value::string).collect();
    vm.set("os.Args", Value::new_slice(TYPE_STRING, args));
    vm.func("os.ReadFile", 1, 1, |vm| {
        let a = vm.take_args(1);
        let path = a[0].as_str();
        let bytes = std::fs::read(path).map_err(|e| {
            PanicError::new(crate::token::Position::NONE, "CALL", format!("{path}: {e}"))
        })?;
        let data: Vec<Value> = bytes.into_iter().map(|b| Value::from_int(b as i32)).collect();
        vm.push_result(Value::new_slice(TYPE_UINT8, data));
        Ok(())
    });
}

fn load_builtin(vm: &mut Vm) {
    vm.func("builtin.print", 0, 0, |vm| {
        let n = vm.stack_len();
        let args = vm.take_args(n);
        vm.write_stdout(&sprint(&args));
        Ok(())
    });
    vm.func("builtin.println", 0, 0, |vm| {
        let n = vm.stack_len();
        let args = vm.take_args(n);
        vm.write_stdout(&sprint(&args));
        vm.write_stdout("\n");
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use crate::vm::{RunOptions, Vm, VmOptions};

    #[test]
    fn math_sqrt_is_registered() {
        let mut vm = Vm::new(VmOptions::default());
        let v = vm.eval("return math.Sqrt(16.0)", &RunOptions::default()).unwrap();
        assert_eq!(v.as_f64(), 4.0);
    }

    #[test]
    fn strings_join_round_trips_split() {
        let mut vm = Vm::new(VmOptions::default());
        let v = vm
            .eval(r#"parts := strings.Split("a,b,c", ",")
return strings.Join(parts, "-")"#, &RunOptions::default())
            .unwrap();
        assert_eq!(v.as_str(), "a-b-c");
    }
}
