//! Stack-based bytecode interpreter. Grounded on
//! `examples/original_source/vm.go` and `do.go`: a `Frame`/backtrace model,
//! one flat `exec` dispatch loop, and the embedding API surface
//! (`NewVM`/`Set`/`Get`/`Load`/`Eval`/`Call`/`Func`) from spec.md §6.1.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::rc::Rc;

use log::trace;

use crate::compiler::{Compiler, FuncChunk, StructType};
use crate::error::{Error, LoadError, PanicError};
use crate::instruction::Opcode;
use crate::intmap::IntMap;
use crate::lexer::Lexer;
use crate::loader::{self, VirtualFs};
use crate::parser::{self, Parser};
use crate::symtab::Lookup;
use crate::token::{Position, Token};
use crate::value::{
    self, mix_type, FuncBody, FuncObj, Obj, SliceObj, StringMapObj, StructObj, Type, Value,
    TYPE_FLOAT64, TYPE_FUNC, TYPE_INT32, TYPE_NIL, TYPE_STRING, TYPE_UINT32, UNTYPED_INT,
};

struct Frame {
    base: usize,
    func: usize,
    pc: usize,
}

/// Functional-option builder for constructing a `Vm` (spec.md §6.3).
#[derive(Default)]
pub struct VmOptions {
    stdout: Option<Rc<RefCell<dyn std::io::Write>>>,
    loader: Option<Rc<dyn VirtualFs>>,
}

impl VmOptions {
    pub fn with_stdout(mut self, out: Rc<RefCell<dyn std::io::Write>>) -> Self {
        self.stdout = Some(out);
        self
    }

    pub fn with_loaders(mut self, fs: Rc<dyn VirtualFs>) -> Self {
        self.loader = Some(fs);
        self
    }
}

/// Per-`Load`/`Eval` run options (spec.md §6.3's dump flags).
pub struct RunOptions {
    tree_dump: bool,
    code_dump: bool,
    eval_imports: bool,
    optimize: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            tree_dump: false,
            code_dump: false,
            eval_imports: false,
            optimize: true,
        }
    }
}

impl RunOptions {
    pub fn with_tree_dump(mut self, on: bool) -> Self {
        self.tree_dump = on;
        self
    }

    /// Disabling this skips the compiler's peephole pass (`--no-optimize`);
    /// on by default.
    pub fn with_optimize(mut self, on: bool) -> Self {
        self.optimize = on;
        self
    }

    pub fn with_code_dump(mut self, on: bool) -> Self {
        self.code_dump = on;
        self
    }

    /// Whether `import` declarations trigger package resolution through the
    /// `Vm`'s configured loader (spec.md §4.3). Off by default so `eval`ing
    /// a bare expression never needs a filesystem.
    pub fn with_eval_imports(mut self, on: bool) -> Self {
        self.eval_imports = on;
        self
    }
}

pub struct Vm {
    funcs: Vec<FuncChunk>,
    globals: Lookup,
    struct_types: HashMap<String, StructType>,
    next_type_n: i32,
    consts: Vec<Value>,
    main: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    backtrace: Vec<(Position, String)>,
    stdout: Option<Rc<RefCell<dyn std::io::Write>>>,
    loader: Option<Rc<dyn VirtualFs>>,
    loaded_packages: HashSet<String>,
    /// Per-type shared method tables (spec.md §4.2/§4.4 receiver methods),
    /// keyed by the struct type's `type_n` and populated by `SetMethod`.
    /// Kept separate from each instance's own `fields`/`lookup`, which stay
    /// per-instance (struct fields are not shared across instances).
    struct_methods: HashMap<i32, Rc<RefCell<IntMap>>>,
}

impl Vm {
    pub fn new(opts: VmOptions) -> Vm {
        let mut vm = Vm {
            funcs: Vec::new(),
            globals: Lookup::new(),
            struct_types: HashMap::new(),
            next_type_n: 1,
            consts: Vec::new(),
            main: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            backtrace: Vec::new(),
            stdout: opts.stdout,
            loader: opts.loader,
            loaded_packages: HashSet::new(),
            struct_methods: HashMap::new(),
        };
        crate::builtin::install(&mut vm);
        vm
    }

    /// Registers a host value at a global name (spec.md §6.1 `Set`).
    pub fn set(&mut self, name: &str, v: Value) {
        self.globals.set(name, v);
    }

    /// Reads a global by name (spec.md §6.1 `Get`).
    pub fn get(&mut self, name: &str) -> Value {
        self.globals.get(name)
    }

    /// Registers a host function under `name` (spec.md §6.1 `Func`).
    pub fn func(
        &mut self,
        name: &str,
        args: i32,
        rets: i32,
        f: impl Fn(&mut Vm) -> Result<(), PanicError> + 'static,
    ) {
        let v = Value {
            tag: TYPE_FUNC,
            num: 0.0,
            obj: Some(Rc::new(Obj::Func(FuncObj {
                args,
                rets,
                variadic: false,
                body: FuncBody::Host(Rc::new(f)),
            }))),
        };
        self.set(name, v);
    }

    /// Pops the top `n` stack values (in call order), for host functions
    /// reading their arguments. Mirrors `builtins.go`'s `get2Pop1v`/`pop1f`
    /// family.
    pub fn take_args(&mut self, n: usize) -> Vec<Value> {
        self.stack.split_off(self.stack.len() - n)
    }

    /// Pushes a host function's result value onto the stack.
    pub fn push_result(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// How many values are currently on the stack above the active frame's
    /// base — used by variadic host functions (`fmt.Print` and friends) to
    /// discover how many arguments they were actually called with.
    pub fn stack_len(&self) -> usize {
        let base = self.frames.last().map(|f| f.base).unwrap_or(0);
        self.stack.len() - base
    }

    /// Writes to the VM's configured stdout, if any (spec.md §6.3).
    pub fn write_stdout(&mut self, s: &str) {
        if let Some(out) = &self.stdout {
            let _ = out.borrow_mut().write_all(s.as_bytes());
        }
    }

    /// Compiles and links `source` into this VM's program, extending the
    /// existing global/function/const tables rather than replacing them, so
    /// names registered through `set`/`func` before `load` keep their slots
    /// and repeated `Load`/`Eval` calls accumulate (spec.md §9, "`Eval`
    /// mutates globals incrementally").
    pub fn load(&mut self, source: &str, opts: &RunOptions) -> Result<(), Error> {
        let file = parse_source(source)?;
        if opts.eval_imports {
            self.resolve_imports(&file, opts)?;
        }
        self.main = self.compile_and_merge(&file, opts)?;
        Ok(())
    }

    /// Resolves every `import` this file declares through the configured
    /// loader, compiling and running each package's top-level
    /// declarations (its "package init") before the caller's own file
    /// compiles, so its names are already global by then (spec.md §4.3).
    fn resolve_imports(&mut self, file: &Token, opts: &RunOptions) -> Result<(), Error> {
        let Some(fs) = self.loader.clone() else {
            return Ok(());
        };
        let direct: Vec<String> = file
            .children
            .iter()
            .filter(|d| d.symbol == "import")
            .map(|d| d.child(0).unquote())
            .collect();
        for root in direct {
            let order = loader::topo_order(&root, |pkg| package_imports(fs.as_ref(), pkg));
            for pkg in order {
                self.load_package(&pkg, fs.as_ref(), opts)?;
            }
        }
        Ok(())
    }

    fn load_package(&mut self, pkg: &str, fs: &dyn VirtualFs, opts: &RunOptions) -> Result<(), Error> {
        if !self.loaded_packages.insert(pkg.to_string()) {
            return Ok(());
        }
        for path in fs.glob(pkg) {
            let source = fs
                .read_file(&path)
                .ok_or_else(|| Error::Load(LoadError::MissingFile(path.clone())))?;
            if let Some(expr) = loader::extract_build_constraint(&source) {
                if !loader::satisfies_constraint(expr, "goat")? {
                    continue;
                }
            }
            let file = parse_source(&source)?;
            let pkg_main = self.compile_and_merge(&file, opts)?;
            self.run_func(pkg_main, &[])?;
        }
        Ok(())
    }

    fn compile_and_merge(&mut self, file: &Token, opts: &RunOptions) -> Result<usize, Error> {
        if opts.tree_dump {
            trace!("tree: {}", file);
        }
        let compiler = Compiler::with_state(
            opts.optimize,
            std::mem::take(&mut self.globals),
            std::mem::take(&mut self.struct_types),
            self.next_type_n,
            std::mem::take(&mut self.funcs),
            std::mem::take(&mut self.consts),
        );
        let compiled = compiler.compile_file(file)?;
        if opts.code_dump {
            for (i, chunk) in compiled.funcs.iter().enumerate() {
                trace!("func[{}] {}:", i, chunk.name);
                for ins in &chunk.code {
                    trace!("  {} {} {} {}", ins.op.name(), ins.a, ins.b, ins.c);
                }
            }
        }
        self.globals = compiled.globals;
        self.struct_types = compiled.struct_types;
        self.next_type_n = compiled.next_type_n;
        self.funcs = compiled.funcs;
        self.consts = compiled.consts;
        Ok(compiled.main)
    }

    /// Compiles and immediately runs `source` (spec.md §6.1 `Eval`).
    pub fn eval(&mut self, source: &str, opts: &RunOptions) -> Result<Value, Error> {
        self.load(source, opts)?;
        self.run_func(self.main, &[])
    }

    /// Invokes a previously declared function by global name (spec.md §6.1
    /// `Call`).
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let fval = self.globals.get(name);
        self.call_value(&fval, args)
    }

    pub fn call_value(&mut self, fval: &Value, args: &[Value]) -> Result<Value, Error> {
        self.call_from_exec(fval, args).map_err(Error::Runtime)
    }

    fn run_func(&mut self, func_idx: usize, args: &[Value]) -> Result<Value, Error> {
        self.run_func_inner(func_idx, args).map_err(Error::Runtime)
    }

    fn run_func_inner(&mut self, func_idx: usize, args: &[Value]) -> Result<Value, PanicError> {
        let base = self.stack.len();
        for a in args {
            self.stack.push(a.clone());
        }
        let num_locals = self.funcs[func_idx].num_locals.max(args.len());
        while self.stack.len() < base + num_locals {
            self.stack.push(Value::nil());
        }
        self.frames.push(Frame {
            base,
            func: func_idx,
            pc: 0,
        });
        self.backtrace
            .push((Position::NONE, self.funcs[func_idx].name.clone()));
        let result = self.exec();
        self.frames.pop();
        self.backtrace.pop();
        match result {
            Ok(()) => {
                let ret = self.stack.pop().unwrap_or_default();
                self.stack.truncate(base);
                Ok(ret)
            }
            Err(mut e) => {
                e.backtrace = self.backtrace.clone();
                self.stack.truncate(base);
                Err(e)
            }
        }
    }

    /// The dispatch loop: executes instructions from the current frame's
    /// function until a `Return` pops the frame.
    fn exec(&mut self) -> Result<(), PanicError> {
        loop {
            let frame_idx = self.frames.len() - 1;
            let (func_idx, pc) = {
                let f = &self.frames[frame_idx];
                (f.func, f.pc)
            };
            let ins = self.funcs[func_idx].code[pc];
            self.frames[frame_idx].pc += 1;

            macro_rules! binop {
                ($method:ident) => {{
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push($method(&a, &b, ins.pos)?);
                }};
            }

            match ins.op {
                Opcode::Pass => {}
                Opcode::Const => {
                    self.stack.push(self.consts[ins.a as usize].clone());
                }
                Opcode::Zero => self.stack.push(Value::nil()),
                Opcode::Pop => {
                    for _ in 0..ins.a.max(1) {
                        self.stack.pop();
                    }
                }
                Opcode::LocalGet => {
                    let base = self.frames[frame_idx].base;
                    self.stack.push(self.stack[base + ins.a as usize].clone());
                }
                Opcode::LocalSet => {
                    let base = self.frames[frame_idx].base;
                    let v = self.stack.pop().unwrap();
                    self.stack[base + ins.a as usize] = v;
                }
                Opcode::GlobalGet => {
                    self.stack.push(self.globals.read(ins.a as usize));
                }
                Opcode::GlobalSet => {
                    let v = self.stack.pop().unwrap();
                    self.globals.write(ins.a as usize, v);
                }
                Opcode::Add => binop!(op_add),
                Opcode::Sub => binop!(op_sub),
                Opcode::Mul => binop!(op_mul),
                Opcode::Div => binop!(op_div),
                Opcode::Mod => binop!(op_mod),
                Opcode::BitAnd => binop!(op_bitand),
                Opcode::BitOr => binop!(op_bitor),
                Opcode::BitXor => binop!(op_bitxor),
                Opcode::BitLsh => binop!(op_bitlsh),
                Opcode::BitRsh => binop!(op_bitrsh),
                Opcode::Lt => binop!(op_lt),
                Opcode::Lte => binop!(op_lte),
                Opcode::Gt => binop!(op_gt),
                Opcode::Gte => binop!(op_gte),
                Opcode::Eq => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::bool_(a.equals(&b)));
                }
                Opcode::Neq => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::bool_(!a.equals(&b)));
                }
                Opcode::And => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::bool_(a.as_bool() && b.as_bool()));
                }
                Opcode::Or => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::bool_(a.as_bool() || b.as_bool()));
                }
                Opcode::Not => {
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::bool_(!a.as_bool()));
                }
                Opcode::Negate => {
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value {
                        tag: a.tag,
                        num: -a.num,
                        obj: None,
                    });
                }
                Opcode::BitComplement => {
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value {
                        tag: a.tag,
                        num: !(a.num as i64) as f64,
                        obj: None,
                    });
                }
                Opcode::IncDec => {
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value {
                        tag: a.tag,
                        num: a.num + ins.a as f64,
                        obj: None,
                    });
                }
                Opcode::LocalIncDec => {
                    let base = self.frames[frame_idx].base;
                    let slot = base + ins.a as usize;
                    let v = &self.stack[slot];
                    self.stack[slot] = Value {
                        tag: v.tag,
                        num: v.num + ins.b as f64,
                        obj: None,
                    };
                }
                Opcode::LocalAdd | Opcode::LocalSub | Opcode::LocalMul | Opcode::LocalDiv => {
                    let base = self.frames[frame_idx].base;
                    let slot = base + ins.a as usize;
                    let b = self.stack.pop().unwrap();
                    let a = self.stack[slot].clone();
                    self.stack[slot] = match ins.op {
                        Opcode::LocalAdd => op_add(&a, &b, ins.pos)?,
                        Opcode::LocalSub => op_sub(&a, &b, ins.pos)?,
                        Opcode::LocalMul => op_mul(&a, &b, ins.pos)?,
                        Opcode::LocalDiv => op_div(&a, &b, ins.pos)?,
                        _ => unreachable!(),
                    };
                }
                Opcode::Jump => {
                    self.frames[frame_idx].pc = ins.a as usize;
                }
                Opcode::JumpFalse => {
                    let v = self.stack.pop().unwrap();
                    if !v.as_bool() {
                        self.frames[frame_idx].pc = ins.a as usize;
                    }
                }
                Opcode::JumpTrue => {
                    let v = self.stack.pop().unwrap();
                    if v.as_bool() {
                        self.frames[frame_idx].pc = ins.a as usize;
                    }
                }
                Opcode::Convert => {
                    let v = self.stack.pop().unwrap();
                    self.stack.push(v.convert(ins.a as Type));
                }
                Opcode::Cast => {
                    let v = self.stack.pop().unwrap();
                    self.stack.push(v.assign(ins.a as Type));
                }
                Opcode::Func => {
                    let chunk = &self.funcs[ins.a as usize];
                    self.stack.push(Value {
                        tag: TYPE_FUNC,
                        num: 0.0,
                        obj: Some(Rc::new(Obj::Func(FuncObj {
                            args: chunk.arity,
                            rets: chunk.rets,
                            variadic: chunk.variadic,
                            body: FuncBody::Compiled(ins.a as usize),
                        }))),
                    });
                }
                Opcode::Call | Opcode::CallVariadic => {
                    let argc = ins.a as usize;
                    let args: Vec<Value> = self.stack.split_off(self.stack.len() - argc);
                    let callee = self.stack.pop().unwrap();
                    if ins.c > 0 {
                        if let Some(Obj::Func(f)) = callee.obj.as_deref() {
                            if f.rets != ins.c {
                                return Err(PanicError::new(
                                    ins.pos,
                                    "CALL",
                                    format!("incorrect returns: want {}, got {}", ins.c, f.rets),
                                ));
                            }
                        }
                    }
                    let ret = match self.call_from_exec(&callee, &args) {
                        Ok(v) => v,
                        Err(mut e) => {
                            if e.pos == Position::NONE {
                                e.pos = ins.pos;
                            }
                            return Err(e);
                        }
                    };
                    self.stack.push(ret);
                }
                Opcode::Return => {
                    let ret = if ins.a > 0 {
                        self.stack.pop().unwrap_or_default()
                    } else {
                        Value::nil()
                    };
                    self.stack.push(ret);
                    return Ok(());
                }
                Opcode::NewSlice => {
                    self.stack.push(Value {
                        tag: value::slice_type(TYPE_NIL),
                        num: 0.0,
                        obj: Some(Rc::new(Obj::Slice(RefCell::new(SliceObj {
                            value_type: TYPE_NIL,
                            data: Vec::new(),
                        })))),
                    });
                }
                Opcode::NewMap => {
                    self.stack.push(Value {
                        tag: value::map_type(TYPE_NIL, TYPE_NIL),
                        num: 0.0,
                        obj: Some(Rc::new(Obj::StringMap(RefCell::new(StringMapObj {
                            value_type: TYPE_NIL,
                            data: Default::default(),
                            keys: Vec::new(),
                        })))),
                    });
                }
                Opcode::Append => {
                    let item = self.stack.pop().unwrap();
                    let v = self.stack.pop().unwrap();
                    self.stack.push(append_value(&v, item));
                }
                Opcode::Len => {
                    let v = self.stack.pop().unwrap();
                    self.stack.push(Value::from_int(len_of(&v) as i32));
                }
                Opcode::Get => {
                    let key = self.stack.pop().unwrap();
                    let v = self.stack.pop().unwrap();
                    self.stack.push(get_index(&v, &key, ins.pos)?);
                }
                Opcode::Set => {
                    let key = self.stack.pop().unwrap();
                    let v = self.stack.pop().unwrap();
                    let val = self.stack.pop().unwrap();
                    set_index(&v, &key, val, ins.pos)?;
                }
                Opcode::Delete => {
                    let key = self.stack.pop().unwrap();
                    let v = self.stack.pop().unwrap();
                    delete_key(&v, &key);
                }
                Opcode::Slice => {
                    let j = self.stack.pop().unwrap();
                    let i = self.stack.pop().unwrap();
                    let v = self.stack.pop().unwrap();
                    self.stack.push(slice_value(&v, i.as_int(), j.as_int()));
                }
                Opcode::Range => {
                    let v = self.stack.pop().unwrap();
                    self.stack.push(make_iterator(&v));
                }
                Opcode::Iter => {
                    let entry = match self.stack.last().unwrap().obj.as_deref() {
                        Some(Obj::Next(cell)) => (cell.borrow_mut())(),
                        _ => None,
                    };
                    match entry {
                        Some((k, val)) => {
                            let base = self.frames[frame_idx].base;
                            if ins.b >= 0 {
                                self.stack[base + ins.b as usize] = k;
                            }
                            if ins.c >= 0 {
                                self.stack[base + ins.c as usize] = val;
                            }
                        }
                        None => {
                            self.frames[frame_idx].pc = ins.a as usize;
                        }
                    }
                }
                Opcode::GetAttr => {
                    let v = self.stack.pop().unwrap();
                    let name = self.globals.key(ins.a as usize).to_string();
                    self.stack.push(get_attr(&v, &name, ins.a as i64, ins.pos)?);
                }
                Opcode::SetAttr => {
                    let v = self.stack.pop().unwrap();
                    let val = self.stack.pop().unwrap();
                    let name = self.globals.key(ins.a as usize).to_string();
                    set_attr(&v, &name, val);
                }
                Opcode::NewStruct => {
                    let type_name = self.consts[ins.a as usize].as_str().to_string();
                    let v = self.alloc_struct(&type_name).ok_or_else(|| {
                        PanicError::new(
                            ins.pos,
                            "NEWSTRUCT",
                            format!("undeclared struct type {type_name:?}"),
                        )
                    })?;
                    self.stack.push(v);
                }
                Opcode::SetMethod => {
                    let f = self.stack.pop().unwrap();
                    let type_n = ins.a;
                    let name_idx = ins.b as i64;
                    self.struct_methods
                        .entry(type_n)
                        .or_insert_with(|| Rc::new(RefCell::new(IntMap::new())))
                        .borrow_mut()
                        .set(name_idx, f);
                }
                Opcode::Panic => {
                    let v = self.stack.pop().unwrap();
                    return Err(PanicError::new(ins.pos, "PANIC", v.to_string()));
                }
                _ => {
                    return Err(PanicError::new(
                        ins.pos,
                        ins.op.name(),
                        "opcode not implemented",
                    ))
                }
            }
        }
    }

    fn call_from_exec(&mut self, callee: &Value, args: &[Value]) -> Result<Value, PanicError> {
        match callee.obj.as_deref() {
            Some(Obj::Func(f)) => {
                let expected = f.args as usize;
                let arity_ok = if f.variadic {
                    args.len() + 1 >= expected
                } else {
                    args.len() == expected
                };
                if !arity_ok {
                    return Err(PanicError::new(
                        Position::NONE,
                        "CALL",
                        format!("incorrect args: want {expected}, got {}", args.len()),
                    ));
                }
                match f.body.clone() {
                    FuncBody::Compiled(idx) => self.run_func_inner(idx, args),
                    FuncBody::Host(host) => {
                        let base = self.stack.len();
                        for a in args {
                            self.stack.push(a.clone());
                        }
                        host(self)?;
                        let ret = self.stack.pop().unwrap_or_default();
                        self.stack.truncate(base);
                        Ok(ret)
                    }
                    FuncBody::Bound(recv, underlying) => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(*recv);
                        full.extend_from_slice(args);
                        self.call_from_exec(&underlying, &full)
                    }
                }
            }
            _ => Err(PanicError::new(Position::NONE, "CALL", "value is not callable")),
        }
    }

    /// Creates a fresh struct instance from a declared type name (support
    /// surface for `NewStruct`/struct literals, spec.md §3.7). Fields start
    /// empty and per-instance; the method table is shared across every
    /// instance of the same `type_n`, looked up (or created) in
    /// `struct_methods` rather than allocated fresh each call, so `SetMethod`
    /// registrations reach instances created before and after it runs.
    pub fn new_struct(&mut self, type_name: &str) -> Option<Value> {
        self.alloc_struct(type_name)
    }

    fn alloc_struct(&mut self, type_name: &str) -> Option<Value> {
        let st: &StructType = self.struct_types.get(type_name)?;
        let type_n = st.type_n;
        let methods = self
            .struct_methods
            .entry(type_n)
            .or_insert_with(|| Rc::new(RefCell::new(IntMap::new())))
            .clone();
        Some(Value {
            tag: value::struct_type(type_n as Type),
            num: 0.0,
            obj: Some(Rc::new(Obj::Struct(RefCell::new(StructObj {
                type_n,
                lookup: Default::default(),
                fields: IntMap::new(),
                methods,
            })))),
        })
    }
}

fn parse_source(source: &str) -> Result<Token, Error> {
    let tokens = Lexer::new(source, 0, &parser::is_known_symbol).tokenize()?;
    Ok(Parser::new(tokens).parse_file()?)
}

/// The direct imports of `pkg`'s files, used by `loader::topo_order` to
/// order transitive package dependencies before `pkg` itself loads. A
/// package whose files fail to parse contributes no edges rather than
/// aborting the whole ordering pass; the real parse error surfaces later
/// when that package is actually loaded.
fn package_imports(fs: &dyn VirtualFs, pkg: &str) -> Vec<String> {
    let mut out = Vec::new();
    for path in fs.glob(pkg) {
        let Some(source) = fs.read_file(&path) else {
            continue;
        };
        let Ok(file) = parse_source(&source) else {
            continue;
        };
        for decl in &file.children {
            if decl.symbol == "import" {
                out.push(decl.child(0).unquote());
            }
        }
    }
    out
}

// --- helpers mirroring value.go's opXxx / mixType family -------------------

fn op_add(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    if t == TYPE_STRING {
        return Ok(Value::string(format!("{}{}", a.as_str(), b.as_str())));
    }
    numeric_binop(t, a.num, b.num, |x, y| x + y, pos)
}

fn op_sub(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| x - y, pos)
}

fn op_mul(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| x * y, pos)
}

fn op_div(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    if b.num == 0.0 && t != TYPE_FLOAT64 {
        return Err(PanicError::new(pos, "DIV", "division by zero"));
    }
    if t == TYPE_FLOAT64 {
        return Ok(Value::float64(a.num / b.num));
    }
    numeric_binop(t, a.num, b.num, |x, y| (x as i64 / y as i64) as f64, pos)
}

fn op_mod(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    if b.num == 0.0 {
        return Err(PanicError::new(pos, "MOD", "division by zero"));
    }
    numeric_binop(t, a.num, b.num, |x, y| (x as i64 % y as i64) as f64, pos)
}

fn op_bitand(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| ((x as i64) & (y as i64)) as f64, pos)
}

fn op_bitor(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| ((x as i64) | (y as i64)) as f64, pos)
}

fn op_bitxor(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| ((x as i64) ^ (y as i64)) as f64, pos)
}

fn op_bitlsh(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| ((x as i64) << (y as i64)) as f64, pos)
}

fn op_bitrsh(a: &Value, b: &Value, pos: Position) -> Result<Value, PanicError> {
    let t = mix_type(a.tag, b.tag);
    numeric_binop(t, a.num, b.num, |x, y| ((x as i64) >> (y as i64)) as f64, pos)
}

fn numeric_binop(
    t: Type,
    a: f64,
    b: f64,
    f: impl Fn(f64, f64) -> f64,
    _pos: Position,
) -> Result<Value, PanicError> {
    let result = f(a, b);
    let wrapped = match t {
        TYPE_INT32 => (result as i64 as i32) as f64,
        TYPE_UINT32 => (result as i64 as u32) as f64,
        TYPE_FLOAT64 => result,
        UNTYPED_INT => result,
        _ => (result as i64 as i32) as f64,
    };
    Ok(Value {
        tag: t,
        num: wrapped,
        obj: None,
    })
}

fn op_lt(a: &Value, b: &Value, _pos: Position) -> Result<Value, PanicError> {
    if a.tag == TYPE_STRING {
        return Ok(Value::bool_(a.as_str() < b.as_str()));
    }
    Ok(Value::bool_(a.num < b.num))
}

fn op_lte(a: &Value, b: &Value, _pos: Position) -> Result<Value, PanicError> {
    if a.tag == TYPE_STRING {
        return Ok(Value::bool_(a.as_str() <= b.as_str()));
    }
    Ok(Value::bool_(a.num <= b.num))
}

fn op_gt(a: &Value, b: &Value, _pos: Position) -> Result<Value, PanicError> {
    if a.tag == TYPE_STRING {
        return Ok(Value::bool_(a.as_str() > b.as_str()));
    }
    Ok(Value::bool_(a.num > b.num))
}

fn op_gte(a: &Value, b: &Value, _pos: Position) -> Result<Value, PanicError> {
    if a.tag == TYPE_STRING {
        return Ok(Value::bool_(a.as_str() >= b.as_str()));
    }
    Ok(Value::bool_(a.num >= b.num))
}

fn len_of(v: &Value) -> usize {
    match v.obj.as_deref() {
        Some(Obj::Str(s)) => s.chars().count(),
        Some(Obj::Slice(s)) => s.borrow().data.len(),
        Some(Obj::StringMap(m)) => m.borrow().data.len(),
        _ => 0,
    }
}

fn append_value(v: &Value, item: Value) -> Value {
    match v.obj.as_deref() {
        Some(Obj::Slice(s)) => {
            let s = s.borrow();
            let mut data = s.data.clone();
            let vt = s.value_type;
            data.push(item.assign(vt));
            Value {
                tag: v.tag,
                num: 0.0,
                obj: Some(Rc::new(Obj::Slice(RefCell::new(SliceObj {
                    value_type: vt,
                    data,
                })))),
            }
        }
        None => Value {
            tag: value::slice_type(TYPE_NIL),
            num: 0.0,
            obj: Some(Rc::new(Obj::Slice(RefCell::new(SliceObj {
                value_type: TYPE_NIL,
                data: vec![item],
            })))),
        },
        _ => v.clone(),
    }
}

fn get_index(v: &Value, key: &Value, pos: Position) -> Result<Value, PanicError> {
    match v.obj.as_deref() {
        Some(Obj::Slice(s)) => {
            let s = s.borrow();
            let i = key.as_int() as usize;
            s.data
                .get(i)
                .cloned()
                .ok_or_else(|| PanicError::new(pos, "GET", format!("index out of range: {i}")))
        }
        Some(Obj::Str(s)) => {
            let i = key.as_int() as usize;
            s.chars()
                .nth(i)
                .map(|c| Value::from_int(c as i32))
                .ok_or_else(|| PanicError::new(pos, "GET", format!("index out of range: {i}")))
        }
        Some(Obj::StringMap(m)) => {
            let m = m.borrow();
            Ok(m.data
                .get(&key.to_string())
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::nil()))
        }
        _ => Err(PanicError::new(pos, "GET", "value has no index operation")),
    }
}

fn set_index(v: &Value, key: &Value, val: Value, pos: Position) -> Result<(), PanicError> {
    match v.obj.as_deref() {
        Some(Obj::Slice(s)) => {
            let mut s = s.borrow_mut();
            let i = key.as_int() as usize;
            if i >= s.data.len() {
                return Err(PanicError::new(pos, "SET", format!("index out of range: {i}")));
            }
            let vt = s.value_type;
            s.data[i] = val.assign(vt);
            Ok(())
        }
        Some(Obj::StringMap(m)) => {
            let mut m = m.borrow_mut();
            let canon = key.to_string();
            if !m.data.contains_key(&canon) {
                m.keys.push(canon.clone());
            }
            let vt = m.value_type;
            m.data.insert(canon, (key.clone(), val.assign(vt)));
            Ok(())
        }
        _ => Err(PanicError::new(pos, "SET", "value has no index operation")),
    }
}

fn delete_key(v: &Value, key: &Value) {
    match v.obj.as_deref() {
        Some(Obj::StringMap(m)) => {
            m.borrow_mut().data.remove(&key.to_string());
        }
        _ => {}
    }
}

fn slice_value(v: &Value, i: i32, j: i32) -> Value {
    match v.obj.as_deref() {
        Some(Obj::Slice(s)) => {
            let s = s.borrow();
            let data = s.data[i as usize..j as usize].to_vec();
            Value {
                tag: v.tag,
                num: 0.0,
                obj: Some(Rc::new(Obj::Slice(RefCell::new(SliceObj {
                    value_type: s.value_type,
                    data,
                })))),
            }
        }
        Some(Obj::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            let sub: String = chars[i as usize..j as usize].iter().collect();
            Value::string(sub)
        }
        _ => v.clone(),
    }
}

/// Wraps an iterable value into a one-shot `Next` object driving `ITER`.
/// Mirrors `examples/original_source/do.go`'s `nextT`, which the reference
/// VM pushes in place of the iterable itself once a `range` starts.
fn make_iterator(v: &Value) -> Value {
    let next_obj = match v.obj.as_deref() {
        Some(Obj::Slice(s)) => {
            let data = s.borrow().data.clone();
            let mut i = 0usize;
            let f = move || -> Option<(Value, Value)> {
                if i >= data.len() {
                    return None;
                }
                let item = data[i].clone();
                let k = Value::from_int(i as i32);
                i += 1;
                Some((k, item))
            };
            Obj::Next(RefCell::new(Box::new(f)))
        }
        Some(Obj::Str(s)) => {
            let chars: Vec<char> = s.chars().collect();
            let mut i = 0usize;
            let f = move || -> Option<(Value, Value)> {
                if i >= chars.len() {
                    return None;
                }
                let k = Value::from_int(i as i32);
                let v = Value::from_int(chars[i] as i32);
                i += 1;
                Some((k, v))
            };
            Obj::Next(RefCell::new(Box::new(f)))
        }
        Some(Obj::StringMap(m)) => {
            let keys = m.borrow().keys.clone();
            let data = m.borrow().data.clone();
            let mut i = 0usize;
            let f = move || -> Option<(Value, Value)> {
                while i < keys.len() {
                    let k = keys[i].clone();
                    i += 1;
                    if let Some((key, v)) = data.get(&k) {
                        return Some((key.clone(), v.clone()));
                    }
                }
                None
            };
            Obj::Next(RefCell::new(Box::new(f)))
        }
        _ => Obj::Next(RefCell::new(Box::new(|| None))),
    };
    Value {
        tag: TYPE_NIL,
        num: 0.0,
        obj: Some(Rc::new(next_obj)),
    }
}

fn get_attr(v: &Value, name: &str, name_idx: i64, pos: Position) -> Result<Value, PanicError> {
    match v.obj.as_deref() {
        Some(Obj::Struct(s)) => {
            let s = s.borrow();
            if let Some(&idx) = s.lookup.get(name) {
                if let Some(val) = s.fields.get(idx as i64) {
                    return Ok(val);
                }
            }
            if let Some(m) = s.methods.borrow().get(name_idx) {
                return Ok(bind_method(v, &m));
            }
            Ok(Value::nil())
        }
        _ => Err(PanicError::new(pos, "GETATTR", format!("no attribute {name:?}"))),
    }
}

/// Wraps an unbound method `Value` (a plain `Obj::Func` over a `Compiled`
/// chunk whose local slot 0 is the receiver) into a bound method that
/// `call_from_exec`'s `FuncBody::Bound` arm prepends `recv` to before
/// dispatching — the declared arity drops by one since the receiver no
/// longer counts as a caller-supplied argument.
fn bind_method(recv: &Value, m: &Value) -> Value {
    let (args, rets, variadic) = match m.obj.as_deref() {
        Some(Obj::Func(f)) => (f.args - 1, f.rets, f.variadic),
        _ => (0, 0, false),
    };
    Value {
        tag: TYPE_FUNC,
        num: 0.0,
        obj: Some(Rc::new(Obj::Func(FuncObj {
            args,
            rets,
            variadic,
            body: FuncBody::Bound(Box::new(recv.clone()), Box::new(m.clone())),
        }))),
    }
}

fn set_attr(v: &Value, name: &str, val: Value) {
    if let Some(Obj::Struct(s)) = v.obj.as_deref() {
        let mut s = s.borrow_mut();
        let next = s.lookup.len();
        let idx = *s.lookup.entry(name.to_string()).or_insert(next);
        s.fields.set(idx as i64, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_int(src: &str) -> i64 {
        let mut vm = Vm::new(VmOptions::default());
        let v = vm.eval(src, &RunOptions::default()).unwrap();
        v.as_f64() as i64
    }

    #[test]
    fn evaluates_arithmetic() {
        assert_eq!(eval_int("return 1 + 2 * 3"), 7);
    }

    #[test]
    fn local_variable_roundtrip() {
        assert_eq!(eval_int("x := 10\nx = x + 5\nreturn x"), 15);
    }

    #[test]
    fn if_else_selects_branch() {
        assert_eq!(
            eval_int("x := 1\nif x == 1 { x = 100 } else { x = 200 }\nreturn x"),
            100
        );
    }

    #[test]
    fn for_loop_accumulates() {
        assert_eq!(
            eval_int("sum := 0\nfor i := 0; i < 5; i = i + 1 { sum = sum + i }\nreturn sum"),
            10
        );
    }

    #[test]
    fn function_call_and_return() {
        assert_eq!(eval_int("func add(a, b) { return a + b }\nreturn add(2, 3)"), 5);
    }

    #[test]
    fn function_may_call_one_declared_later_in_the_file() {
        assert_eq!(
            eval_int(
                "func first() { return second() }\nfunc second() { return 9 }\nreturn first()"
            ),
            9
        );
    }

    #[test]
    fn host_function_registered_before_eval_is_callable_from_source() {
        let mut vm = Vm::new(VmOptions::default());
        vm.func("double", 1, 1, |vm| {
            let n = vm.stack.pop().unwrap().as_int();
            vm.stack.push(Value::from_int(n * 2));
            Ok(())
        });
        let v = vm.eval("return double(21)", &RunOptions::default()).unwrap();
        assert_eq!(v.as_int(), 42);
    }

    #[test]
    fn division_by_zero_panics() {
        let mut vm = Vm::new(VmOptions::default());
        assert!(vm.eval("return 1 / 0", &RunOptions::default()).is_err());
    }

    #[test]
    fn repeated_eval_reuses_earlier_globals() {
        let mut vm = Vm::new(VmOptions::default());
        vm.set("counter", Value::from_int(10));
        let v = vm.eval("return counter + 1", &RunOptions::default()).unwrap();
        assert_eq!(v.as_int(), 11);
    }

    #[test]
    fn struct_literal_field_mutation() {
        assert_eq!(
            eval_int(
                "type T struct { X int }\nt := &T{X: 6}\nt.X *= t.X + 1\nreturn t.X"
            ),
            42
        );
    }

    #[test]
    fn receiver_method_dispatch() {
        assert_eq!(
            eval_int(
                "type T struct { X int }\nfunc (t *T) M(y int) int { return t.X * y }\nreturn (&T{X: 6}).M(7)"
            ),
            42
        );
    }

    #[test]
    fn map_literal_and_range() {
        assert_eq!(
            eval_int(
                "m := map[int]int{10: 30, 7: -5}\nvar r int\nfor k, v := range m { r += k + v }\nreturn r"
            ),
            42
        );
    }

    #[test]
    fn slice_literal_append_and_slice_expr() {
        assert_eq!(
            eval_int("xs := []int{1, 2, 3}\nxs = append(xs, 4)\nys := xs[1:3]\nreturn len(ys)"),
            2
        );
    }

    #[test]
    fn const_group_iota_increments() {
        assert_eq!(
            eval_int("const (\n a = iota\n b\n c\n)\nreturn a + b + c"),
            3
        );
    }

    #[test]
    fn calling_a_value_less_function_as_a_value_is_an_error() {
        let mut vm = Vm::new(VmOptions::default());
        let err = vm
            .eval("func f() {}\nx := f()\nreturn x", &RunOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("incorrect returns"));
    }

    #[test]
    fn delete_removes_map_entry() {
        assert_eq!(
            eval_int(
                "m := map[int]int{1: 1, 2: 2}\ndelete(m, 1)\nreturn len(m)"
            ),
            1
        );
    }
}
