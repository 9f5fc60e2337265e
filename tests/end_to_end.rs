//! End-to-end scenarios driven entirely through the public embedding API
//! (`Vm`/`VmOptions`/`RunOptions`), mirroring the eval-then-assert shape of
//! `examples/original_source/vm_test.go`.

use goatvm::{RunOptions, Vm, VmOptions};

fn eval_int(src: &str) -> i64 {
    let mut vm = Vm::new(VmOptions::default());
    let v = vm.eval(src, &RunOptions::default()).unwrap();
    v.as_f64() as i64
}

fn eval_int_unoptimized(src: &str) -> i64 {
    let mut vm = Vm::new(VmOptions::default());
    let opts = RunOptions::default().with_optimize(false);
    let v = vm.eval(src, &opts).unwrap();
    v.as_f64() as i64
}

#[test]
fn subtraction() {
    assert_eq!(eval_int("a := 2\nb := 3\nreturn b - a"), 1);
}

#[test]
fn for_loop_sums_to_ten() {
    let src = "x := 0\nfor i := 0; i < 5; i++ { x += i }\nreturn x";
    assert_eq!(eval_int(src), 10);
    assert_eq!(eval_int_unoptimized(src), 10);
}

#[test]
fn range_over_map_sums_keys_and_values() {
    let src = "m := make(nil)\nm[10] = 30\nm[7] = -5\nr := 0\nfor k, v := range m { r += k + v }\nreturn r";
    assert_eq!(eval_int(src), 42);
}

#[test]
fn recursive_function_call() {
    let src = "func fib(n) {\nif n < 2 { return n }\nreturn fib(n-1) + fib(n-2)\n}\nreturn fib(10)";
    assert_eq!(eval_int(src), 55);
}

#[test]
fn host_function_is_callable_from_source() {
    let mut vm = Vm::new(VmOptions::default());
    vm.func("triple", 1, 1, |vm| {
        let a = vm.take_args(1);
        vm.push_result(goatvm::Value::from_int(a[0].as_int() * 3));
        Ok(())
    });
    let v = vm.eval("return triple(14)", &RunOptions::default()).unwrap();
    assert_eq!(v.as_int(), 42);
}

#[test]
fn calling_a_zero_arg_function_with_an_argument_panics() {
    let mut vm = Vm::new(VmOptions::default());
    let err = vm
        .eval("func f() {}\nf(42)", &RunOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("incorrect args"));
}

#[test]
fn panic_builtin_carries_its_message() {
    let mut vm = Vm::new(VmOptions::default());
    let err = vm.eval(r#"panic("hello")"#, &RunOptions::default()).unwrap_err();
    assert!(err.to_string().contains("hello"));
}

#[test]
fn division_by_zero_is_a_runtime_panic_not_a_compile_error() {
    let mut vm = Vm::new(VmOptions::default());
    assert!(vm.eval("return 1 / 0", &RunOptions::default()).is_err());
}

#[test]
fn optimized_and_unoptimized_dispatch_agree_on_conditional_accumulation() {
    let src = "sum := 0\nfor i := 0; i < 20; i++ {\nif i % 2 == 0 { sum = sum + i }\n}\nreturn sum";
    assert_eq!(eval_int(src), eval_int_unoptimized(src));
}

#[test]
fn struct_literal_field_is_mutable_through_a_pointer_receiver_shape() {
    let src = "type T struct { X int }\nt := &T{X: 6}\nt.X *= t.X + 1\nreturn t.X";
    assert_eq!(eval_int(src), 42);
}

#[test]
fn method_call_on_a_struct_literal_dispatches_through_the_receiver() {
    let src = "type T struct { X int }\nfunc (t *T) M(y int) int { return t.X * y }\nreturn (&T{X: 6}).M(7)";
    assert_eq!(eval_int(src), 42);
}

#[test]
fn two_instances_of_a_type_share_the_same_method() {
    let src = "type T struct { X int }\nfunc (t *T) M() int { return t.X }\na := &T{X: 1}\nb := &T{X: 41}\nreturn a.M() + b.M()";
    assert_eq!(eval_int(src), 42);
}

#[test]
fn map_literal_supports_range_over_numeric_keys() {
    let src = "m := map[int]int{10: 30, 7: -5}\nvar r int\nfor k, v := range m { r += k + v }\nreturn r";
    assert_eq!(eval_int(src), 42);
}

#[test]
fn slice_literal_append_len_and_slice_expression() {
    let src = "xs := []int{1, 2, 3}\nxs = append(xs, 39)\nreturn len(xs) + xs[3]";
    assert_eq!(eval_int(src), 43);
}

#[test]
fn const_group_with_iota_numbers_rows_from_zero() {
    let src = "const (\n a = iota\n b\n c\n)\nreturn a + b + c";
    assert_eq!(eval_int(src), 3);
}

#[test]
fn assigning_a_value_less_call_to_a_variable_is_an_incorrect_returns_error() {
    let mut vm = Vm::new(VmOptions::default());
    let err = vm
        .eval("func f() {}\nx := f()\nreturn x", &RunOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("incorrect returns"));
}
