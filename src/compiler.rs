//! Tree -> flat instruction compiler, plus the two-pass peephole optimizer.
//! Grounded on `examples/original_source/compiler.go`: name resolution
//! order (locals -> qualified global -> built-in -> unqualified global),
//! `CAST` on typed declaration/assignment, `CONVERT` on explicit
//! conversion calls, and the control-flow compilation patterns for
//! `if`/`for`/`switch` (jump-patching with forward-reference fixups).

use std::collections::HashMap;

use crate::error::CompileError;
use crate::instruction::{Instruction, Opcode};
use crate::symtab::Lookup;
use crate::token::{Position, Token};
use crate::value::Value;

/// One compiled function body: its instruction stream and the high-water
/// mark of local slots it needs (spec.md §4.4, "local register file").
#[derive(Clone)]
pub struct FuncChunk {
    pub code: Vec<Instruction>,
    pub num_locals: usize,
    pub arity: i32,
    pub variadic: bool,
    pub name: String,
    /// Declared return-value count (spec.md §4.4's multi-return arity
    /// check). Taken from an explicit return-type clause when the
    /// declaration has one; otherwise inferred from whether the body
    /// contains any `return <expr>` (see `body_has_return_value`), so
    /// legacy declarations with no return-type clause but a real
    /// `return x` still count as returning one value.
    pub rets: i32,
}

pub struct CompiledProgram {
    pub funcs: Vec<FuncChunk>,
    pub globals: Lookup,
    /// Maps a struct type name to its declared field-name -> slot-index map
    /// and its global type-table index (used to tag `Value`s of that type).
    pub struct_types: HashMap<String, StructType>,
    pub main: usize,
    pub consts: Vec<Value>,
    pub next_type_n: i32,
}

#[derive(Clone)]
pub struct StructType {
    pub type_n: i32,
    pub fields: HashMap<String, usize>,
}

/// True if `tok`'s subtree contains a `return <expr>` anywhere in the same
/// function body (nested `func`/`method` bodies are not descended into,
/// since their returns belong to the closure, not the enclosing one).
fn body_has_return_value(tok: &Token) -> bool {
    match tok.symbol.as_str() {
        "return" => !tok.children.is_empty(),
        "func" | "method" => false,
        _ => tok.children.iter().any(body_has_return_value),
    }
}

/// Declared return arity for a function: an explicit return-type clause
/// wins, otherwise it's inferred from whether the body ever returns a
/// value (spec.md §4.4's multi-return arity check, §8 scenario "incorrect
/// returns").
fn func_rets_count(rets_clause: &Token, body: &Token) -> i32 {
    if !rets_clause.children.is_empty() {
        rets_clause.children.len() as i32
    } else if body_has_return_value(body) {
        1
    } else {
        0
    }
}

/// Unwraps a `"u*"`-wrapped pointer-receiver type down to its bare type
/// name (`*T` and `T` receivers name the same struct type).
fn receiver_type_name(recv_type: &Token) -> String {
    if recv_type.symbol == "u*" {
        recv_type.children[0].text.clone()
    } else {
        recv_type.text.clone()
    }
}

struct LoopLabels {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

struct FuncCtx {
    locals: Lookup,
    code: Vec<Instruction>,
    loops: Vec<LoopLabels>,
    name: String,
    arity: i32,
    variadic: bool,
}

impl FuncCtx {
    fn emit(&mut self, op: Opcode, a: i32, b: i32, c: i32, pos: Position) -> usize {
        self.code.push(Instruction::new(op, a, b, c, pos));
        self.code.len() - 1
    }

    fn patch_jump_target(&mut self, at: usize, target: usize) {
        self.code[at].a = target as i32;
    }
}

pub struct Compiler {
    pub optimize: bool,
    globals: Lookup,
    struct_types: HashMap<String, StructType>,
    next_type_n: i32,
    funcs: Vec<FuncChunk>,
    consts: Vec<Value>,
}

impl Compiler {
    pub fn new(optimize: bool) -> Compiler {
        Compiler::with_state(optimize, Lookup::new(), HashMap::new(), 1, Vec::new(), Vec::new())
    }

    /// Seeds a compiler with state carried over from a prior `compile_file`
    /// call, so repeated incremental compiles (spec.md §6.1 `Load`/`Eval`)
    /// keep the same global slot numbering, function indices, struct type
    /// tags, and constant-pool indices that already-loaded bytecode depends
    /// on, instead of starting over at zero each time.
    pub fn with_state(
        optimize: bool,
        globals: Lookup,
        struct_types: HashMap<String, StructType>,
        next_type_n: i32,
        funcs: Vec<FuncChunk>,
        consts: Vec<Value>,
    ) -> Compiler {
        Compiler {
            optimize,
            globals,
            struct_types,
            next_type_n,
            funcs,
            consts,
        }
    }

    /// Compiles one already-parsed `(file)` tree into a complete program.
    /// Declarations are processed in two sweeps, matching the reference:
    /// first every `type`/`func` name is registered (so forward references
    /// resolve), then every body is compiled.
    pub fn compile_file(mut self, file: &Token) -> Result<CompiledProgram, CompileError> {
        for decl in &file.children {
            if decl.symbol == "type" {
                self.predeclare_type(decl)?;
            }
            if decl.symbol == "func" {
                let name = decl.child(0).text.clone();
                if !name.is_empty() {
                    self.globals.index(&name);
                }
            }
        }

        let mut main = FuncCtx {
            locals: Lookup::new(),
            code: Vec::new(),
            loops: Vec::new(),
            name: "main".to_string(),
            arity: 0,
            variadic: false,
        };

        // Top-level functions are hoisted: every named function is bound to
        // its global slot before any top-level statement runs, so a
        // statement may call a function declared later in the file.
        let mut func_globals = Vec::new();
        for decl in &file.children {
            if decl.symbol == "func" {
                if let Some(binding) = self.compile_func_decl(decl)? {
                    func_globals.push(binding);
                }
            }
        }
        for (name, chunk_idx) in &func_globals {
            let slot = self.globals.index(name) as i32;
            main.emit(Opcode::Func, *chunk_idx as i32, 0, 0, file.pos);
            main.emit(Opcode::GlobalSet, slot, 0, 0, file.pos);
        }

        // Methods are hoisted the same way, but bound into the receiver
        // type's shared method table (`SetMethod`) instead of a global.
        for decl in &file.children {
            if decl.symbol == "method" {
                let (type_name, method_name, chunk_idx) = self.compile_method_decl(decl)?;
                let type_n = self
                    .struct_types
                    .get(&type_name)
                    .ok_or_else(|| CompileError::Internal {
                        pos: decl.pos,
                        message: format!("method receiver on undeclared type {:?}", type_name),
                    })?
                    .type_n;
                let name_slot = self.globals.index(&method_name) as i32;
                main.emit(Opcode::Func, chunk_idx as i32, 0, 0, decl.pos);
                main.emit(Opcode::SetMethod, type_n, name_slot, 0, decl.pos);
            }
        }

        for decl in &file.children {
            match decl.symbol.as_str() {
                "func" | "method" | "type" | "package" | "import" => {}
                _ => {
                    self.compile_stmt(&mut main, decl)?;
                }
            }
        }
        main.emit(Opcode::Return, 0, 0, 0, file.pos);
        let main_chunk = FuncChunk {
            code: main.code,
            num_locals: main.locals.cap(),
            arity: 0,
            variadic: false,
            name: "main".to_string(),
            rets: 0,
        };
        let main_idx = self.funcs.len();
        self.funcs.push(main_chunk);

        let mut funcs = self.funcs;
        if self.optimize {
            for chunk in &mut funcs {
                optimize_chunk(&mut chunk.code);
            }
        }

        Ok(CompiledProgram {
            funcs,
            globals: self.globals,
            struct_types: self.struct_types,
            main: main_idx,
            consts: self.consts,
            next_type_n: self.next_type_n,
        })
    }

    fn add_const(&mut self, v: Value) -> i32 {
        self.consts.push(v);
        (self.consts.len() - 1) as i32
    }

    fn predeclare_type(&mut self, decl: &Token) -> Result<(), CompileError> {
        let name = decl.child(0).text.clone();
        let type_n = self.next_type_n;
        self.next_type_n += 1;
        let mut fields = HashMap::new();
        if decl.children.len() > 1 && decl.child(1).symbol == "fields" {
            for field in &decl.child(1).children {
                let fname = field.child(0).text.clone();
                let idx = fields.len();
                fields.insert(fname, idx);
            }
        }
        self.struct_types
            .insert(name, StructType { type_n, fields });
        Ok(())
    }

    fn compile_func_decl(&mut self, decl: &Token) -> Result<Option<(String, usize)>, CompileError> {
        let name = decl.child(0).text.clone();
        let params = &decl.child(1);
        let rets_clause = &decl.child(2);
        let body = &decl.child(3);

        let mut ctx = FuncCtx {
            locals: Lookup::new(),
            code: Vec::new(),
            loops: Vec::new(),
            name: if name.is_empty() {
                format!("func@{}", decl.pos)
            } else {
                name.clone()
            },
            arity: params.children.len() as i32,
            variadic: false,
        };
        for p in &params.children {
            let pname = if p.symbol == "(name)" { &p.text } else { &p.children[0].text };
            ctx.locals.index(pname);
        }

        for stmt in &body.children {
            self.compile_stmt(&mut ctx, stmt)?;
        }
        ctx.emit(Opcode::Return, 0, 0, 0, body.pos);

        let rets = func_rets_count(rets_clause, body);
        let chunk_idx = self.funcs.len();
        self.funcs.push(FuncChunk {
            code: ctx.code,
            num_locals: ctx.locals.cap(),
            arity: ctx.arity,
            variadic: ctx.variadic,
            name: ctx.name,
            rets,
        });
        if name.is_empty() {
            Ok(None)
        } else {
            self.globals.index(&name);
            Ok(Some((name, chunk_idx)))
        }
    }

    /// Compiles a receiver-method declaration (`func (t *T) M(...) {...}`,
    /// spec.md §4.2/§4.4) into its own `FuncChunk`, receiver bound as local
    /// slot 0 — the same shape `call_from_exec`'s `FuncBody::Bound` arm
    /// already knows how to invoke after `get_attr` prepends the receiver.
    fn compile_method_decl(
        &mut self,
        decl: &Token,
    ) -> Result<(String, String, usize), CompileError> {
        let method_name = decl.child(0).text.clone();
        let recv = decl.child(1);
        let params = decl.child(2);
        let rets_clause = decl.child(3);
        let body = decl.child(4);

        let recv_name = recv.child(0).text.clone();
        let type_name = receiver_type_name(recv.child(1));

        let mut ctx = FuncCtx {
            locals: Lookup::new(),
            code: Vec::new(),
            loops: Vec::new(),
            name: format!("{}.{}", type_name, method_name),
            arity: params.children.len() as i32 + 1,
            variadic: false,
        };
        ctx.locals.index(&recv_name);
        for p in &params.children {
            let pname = if p.symbol == "(name)" { &p.text } else { &p.children[0].text };
            ctx.locals.index(pname);
        }

        for stmt in &body.children {
            self.compile_stmt(&mut ctx, stmt)?;
        }
        ctx.emit(Opcode::Return, 0, 0, 0, body.pos);

        let rets = func_rets_count(rets_clause, body);
        let chunk_idx = self.funcs.len();
        self.funcs.push(FuncChunk {
            code: ctx.code,
            num_locals: ctx.locals.cap(),
            arity: ctx.arity,
            variadic: ctx.variadic,
            name: ctx.name,
            rets,
        });
        Ok((type_name, method_name, chunk_idx))
    }

    // --- statements ---------------------------------------------------

    fn compile_stmt(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        match tok.symbol.as_str() {
            "block" => {
                for child in &tok.children {
                    self.compile_stmt(ctx, child)?;
                }
                Ok(())
            }
            "var" | "const" => {
                for spec in &tok.children {
                    self.compile_var_spec(ctx, spec)?;
                }
                Ok(())
            }
            ":=" => {
                self.compile_short_decl(ctx, tok)?;
                Ok(())
            }
            "=" => {
                self.compile_assign(ctx, tok)?;
                Ok(())
            }
            "+=" | "-=" | "*=" | "/=" => {
                self.compile_compound_assign(ctx, tok)?;
                Ok(())
            }
            "++" | "--" => {
                self.compile_incdec(ctx, tok)?;
                Ok(())
            }
            "return" => {
                for child in &tok.children {
                    self.compile_expr(ctx, child)?;
                }
                ctx.emit(Opcode::Return, tok.children.len() as i32, 0, 0, tok.pos);
                Ok(())
            }
            "if" => self.compile_if(ctx, tok),
            "for" | "forc" | "forcond" | "forrange" => self.compile_for(ctx, tok),
            "break" => {
                let jmp = ctx.emit(Opcode::Jump, 0, 0, 0, tok.pos);
                ctx.loops
                    .last_mut()
                    .ok_or_else(|| CompileError::Internal {
                        pos: tok.pos,
                        message: "break outside loop".into(),
                    })?
                    .break_jumps
                    .push(jmp);
                Ok(())
            }
            "continue" => {
                let jmp = ctx.emit(Opcode::Jump, 0, 0, 0, tok.pos);
                ctx.loops
                    .last_mut()
                    .ok_or_else(|| CompileError::Internal {
                        pos: tok.pos,
                        message: "continue outside loop".into(),
                    })?
                    .continue_jumps
                    .push(jmp);
                Ok(())
            }
            "switch" => self.compile_switch(ctx, tok),
            "type" | "method" => Ok(()),
            _ => {
                // expression statement
                self.compile_expr(ctx, tok)?;
                ctx.emit(Opcode::Pop, 1, 0, 0, tok.pos);
                Ok(())
            }
        }
    }

    fn compile_var_spec(&mut self, ctx: &mut FuncCtx, spec: &Token) -> Result<(), CompileError> {
        let name = spec.child(0).text.clone();
        let slot = ctx.locals.index(&name) as i32;
        if spec.children.len() > 1 {
            let value_tok = spec.children.last().unwrap();
            self.compile_expr(ctx, value_tok)?;
        } else {
            ctx.emit(Opcode::Zero, 0, 0, 0, spec.pos);
        }
        ctx.emit(Opcode::LocalSet, slot, 0, 0, spec.pos);
        Ok(())
    }

    fn compile_short_decl(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let lhs = &tok.children[0];
        let rhs = &tok.children[1];
        self.compile_value_expr(ctx, lhs, rhs)?;
        let slot = ctx.locals.index(&lhs.text) as i32;
        ctx.emit(Opcode::LocalSet, slot, 0, 0, tok.pos);
        Ok(())
    }

    fn compile_assign(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let lhs = &tok.children[0];
        let rhs = &tok.children[1];
        self.compile_value_expr(ctx, lhs, rhs)?;
        self.compile_store(ctx, lhs)
    }

    /// Compiles the right-hand side of a single-target `:=`/`=`. When the
    /// rhs is directly a call expression, threads an expected-return-count
    /// of 1 through to `compile_call` (spec.md §4.4/§8: `func f() {};
    /// x := f()` must fail with "incorrect returns"); a multi-target lhs
    /// (a `","` chain) isn't checked, since this VM has no multi-return
    /// calling convention to check arity against.
    fn compile_value_expr(
        &mut self,
        ctx: &mut FuncCtx,
        lhs: &Token,
        rhs: &Token,
    ) -> Result<(), CompileError> {
        if rhs.symbol == "call" && lhs.symbol == "(name)" {
            self.compile_call(ctx, rhs, 1)
        } else {
            self.compile_expr(ctx, rhs)
        }
    }

    fn compile_compound_assign(
        &mut self,
        ctx: &mut FuncCtx,
        tok: &Token,
    ) -> Result<(), CompileError> {
        let lhs = &tok.children[0];
        let rhs = &tok.children[1];
        self.compile_expr(ctx, lhs)?;
        self.compile_expr(ctx, rhs)?;
        let op = match tok.symbol.as_str() {
            "+=" => Opcode::Add,
            "-=" => Opcode::Sub,
            "*=" => Opcode::Mul,
            "/=" => Opcode::Div,
            _ => unreachable!(),
        };
        ctx.emit(op, 0, 0, 0, tok.pos);
        self.compile_store(ctx, lhs)
    }

    fn compile_incdec(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let target = &tok.children[0];
        let delta = if tok.symbol == "++" { 1 } else { -1 };
        if target.symbol == "(name)" {
            let slot = ctx.locals.index(&target.text) as i32;
            ctx.emit(Opcode::LocalGet, slot, 0, 0, tok.pos);
            ctx.emit(Opcode::IncDec, delta, 0, 0, tok.pos);
            ctx.emit(Opcode::LocalSet, slot, 0, 0, tok.pos);
            Ok(())
        } else {
            self.compile_expr(ctx, target)?;
            ctx.emit(Opcode::IncDec, delta, 0, 0, tok.pos);
            self.compile_store(ctx, target)
        }
    }

    fn compile_store(&mut self, ctx: &mut FuncCtx, lhs: &Token) -> Result<(), CompileError> {
        match lhs.symbol.as_str() {
            "(name)" => {
                if lhs.text == "_" {
                    ctx.emit(Opcode::Pop, 1, 0, 0, lhs.pos);
                } else if ctx.locals.exists(&lhs.text) {
                    let slot = ctx.locals.index(&lhs.text) as i32;
                    ctx.emit(Opcode::LocalSet, slot, 0, 0, lhs.pos);
                } else {
                    let slot = self.globals.index(&lhs.text) as i32;
                    ctx.emit(Opcode::GlobalSet, slot, 0, 0, lhs.pos);
                }
                Ok(())
            }
            "index" => {
                self.compile_expr(ctx, &lhs.children[0])?;
                self.compile_expr(ctx, &lhs.children[1])?;
                ctx.emit(Opcode::Set, 0, 0, 0, lhs.pos);
                Ok(())
            }
            "." => {
                self.compile_expr(ctx, &lhs.children[0])?;
                let attr = self.globals.index(&lhs.children[1].text) as i32;
                ctx.emit(Opcode::SetAttr, attr, 0, 0, lhs.pos);
                Ok(())
            }
            _ => Err(CompileError::Internal {
                pos: lhs.pos,
                message: format!("invalid assignment target {:?}", lhs.symbol),
            }),
        }
    }

    fn compile_if(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        self.compile_expr(ctx, &tok.children[0])?;
        let jfalse = ctx.emit(Opcode::JumpFalse, 0, 0, 0, tok.pos);
        self.compile_stmt(ctx, &tok.children[1])?;
        if tok.children.len() > 2 {
            let jend = ctx.emit(Opcode::Jump, 0, 0, 0, tok.pos);
            let else_target = ctx.code.len();
            ctx.patch_jump_target(jfalse, else_target);
            self.compile_stmt(ctx, &tok.children[2])?;
            let end = ctx.code.len();
            ctx.patch_jump_target(jend, end);
        } else {
            let end = ctx.code.len();
            ctx.patch_jump_target(jfalse, end);
        }
        Ok(())
    }

    fn compile_for(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        match tok.symbol.as_str() {
            "for" => {
                ctx.loops.push(LoopLabels {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                let start = ctx.code.len();
                self.compile_stmt(ctx, &tok.children[0])?;
                ctx.emit(Opcode::Jump, start as i32, 0, 0, tok.pos);
                self.finish_loop(ctx, start);
                Ok(())
            }
            "forcond" => {
                ctx.loops.push(LoopLabels {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                let start = ctx.code.len();
                self.compile_expr(ctx, &tok.children[0])?;
                let jfalse = ctx.emit(Opcode::JumpFalse, 0, 0, 0, tok.pos);
                self.compile_stmt(ctx, &tok.children[1])?;
                ctx.emit(Opcode::Jump, start as i32, 0, 0, tok.pos);
                let end = ctx.code.len();
                ctx.patch_jump_target(jfalse, end);
                self.finish_loop(ctx, start);
                Ok(())
            }
            "forc" => {
                self.compile_stmt(ctx, &tok.children[0])?;
                ctx.loops.push(LoopLabels {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                let start = ctx.code.len();
                self.compile_expr(ctx, &tok.children[1])?;
                let jfalse = ctx.emit(Opcode::JumpFalse, 0, 0, 0, tok.pos);
                self.compile_stmt(ctx, &tok.children[3])?;
                let post_start = ctx.code.len();
                self.compile_stmt(ctx, &tok.children[2])?;
                ctx.emit(Opcode::Jump, start as i32, 0, 0, tok.pos);
                let end = ctx.code.len();
                ctx.patch_jump_target(jfalse, end);
                self.finish_loop_with_continue_target(ctx, post_start);
                Ok(())
            }
            "forrange" => {
                let names = &tok.children[0];
                let iterable = &tok.children[1];
                let body = &tok.children[2];
                self.compile_expr(ctx, iterable)?;
                ctx.emit(Opcode::Range, 0, 0, 0, tok.pos);
                ctx.loops.push(LoopLabels {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                let start = ctx.code.len();
                let key_slot = if !names.children.is_empty() {
                    ctx.locals.index(&names.children[0].text) as i32
                } else {
                    -1
                };
                let val_slot = if names.children.len() > 1 {
                    ctx.locals.index(&names.children[1].text) as i32
                } else {
                    -1
                };
                let iter_pc = ctx.emit(
                    Opcode::Iter,
                    0,
                    key_slot,
                    val_slot,
                    tok.pos,
                );
                self.compile_stmt(ctx, body)?;
                ctx.emit(Opcode::Jump, start as i32, 0, 0, tok.pos);
                let end = ctx.code.len();
                ctx.code[iter_pc].a = end as i32;
                self.finish_loop(ctx, start);
                ctx.emit(Opcode::Pop, 1, 0, 0, tok.pos);
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn finish_loop(&mut self, ctx: &mut FuncCtx, continue_target: usize) {
        self.finish_loop_with_continue_target(ctx, continue_target);
    }

    fn finish_loop_with_continue_target(&mut self, ctx: &mut FuncCtx, continue_target: usize) {
        let labels = ctx.loops.pop().unwrap();
        let end = ctx.code.len();
        for j in labels.break_jumps {
            ctx.patch_jump_target(j, end);
        }
        for j in labels.continue_jumps {
            ctx.patch_jump_target(j, continue_target);
        }
    }

    fn compile_switch(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let subject = &tok.children[0];
        let mut end_jumps = Vec::new();
        let mut prev_false: Option<usize> = None;
        for case in &tok.children[1..] {
            if let Some(j) = prev_false {
                let here = ctx.code.len();
                ctx.patch_jump_target(j, here);
            }
            if case.symbol == "default" {
                self.compile_stmt(ctx, &case.children[0])?;
                prev_false = None;
                continue;
            }
            let mut any_match_jumps = Vec::new();
            for (i, val) in case.children[..case.children.len() - 1].iter().enumerate() {
                self.compile_expr(ctx, subject)?;
                self.compile_expr(ctx, val)?;
                ctx.emit(Opcode::Eq, 0, 0, 0, case.pos);
                if i + 2 < case.children.len() {
                    let jt = ctx.emit(Opcode::JumpTrue, 0, 0, 0, case.pos);
                    any_match_jumps.push(jt);
                } else {
                    prev_false = Some(ctx.emit(Opcode::JumpFalse, 0, 0, 0, case.pos));
                }
            }
            for j in any_match_jumps {
                let here = ctx.code.len();
                ctx.patch_jump_target(j, here);
            }
            self.compile_stmt(ctx, case.children.last().unwrap())?;
            end_jumps.push(ctx.emit(Opcode::Jump, 0, 0, 0, case.pos));
        }
        if let Some(j) = prev_false {
            let here = ctx.code.len();
            ctx.patch_jump_target(j, here);
        }
        let end = ctx.code.len();
        for j in end_jumps {
            ctx.patch_jump_target(j, end);
        }
        Ok(())
    }

    // --- expressions ----------------------------------------------------

    fn compile_expr(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        match tok.symbol.as_str() {
            "(int)" => {
                let idx = self.add_const(Value::untyped_int(tok.int_value()));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "(float)" => {
                let idx = self.add_const(Value::float64(tok.float_value()));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "(string)" => {
                let idx = self.add_const(Value::string(tok.unquote()));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "(char)" => {
                let idx = self.add_const(Value::untyped_int(tok.char_value() as i64));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "true" => {
                let idx = self.add_const(Value::bool_(true));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "false" => {
                let idx = self.add_const(Value::bool_(false));
                ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
                Ok(())
            }
            "nil" => {
                ctx.emit(Opcode::Zero, 0, 0, 0, tok.pos);
                Ok(())
            }
            "(name)" => self.compile_name(ctx, tok),
            "+" | "-" | "*" | "/" | "%" | "<" | "<=" | ">" | ">=" | "==" | "!=" | "&&" | "||"
            | "&" | "|" | "^" | "<<" | ">>" => {
                self.compile_expr(ctx, &tok.children[0])?;
                self.compile_expr(ctx, &tok.children[1])?;
                let op = binary_opcode(&tok.symbol);
                ctx.emit(op, 0, 0, 0, tok.pos);
                Ok(())
            }
            "u-" => {
                self.compile_expr(ctx, &tok.children[0])?;
                ctx.emit(Opcode::Negate, 0, 0, 0, tok.pos);
                Ok(())
            }
            "u!" => {
                self.compile_expr(ctx, &tok.children[0])?;
                ctx.emit(Opcode::Not, 0, 0, 0, tok.pos);
                Ok(())
            }
            "u~" => {
                self.compile_expr(ctx, &tok.children[0])?;
                ctx.emit(Opcode::BitComplement, 0, 0, 0, tok.pos);
                Ok(())
            }
            "index" => {
                self.compile_expr(ctx, &tok.children[0])?;
                self.compile_expr(ctx, &tok.children[1])?;
                ctx.emit(Opcode::Get, 0, 0, 0, tok.pos);
                Ok(())
            }
            "." => {
                self.compile_expr(ctx, &tok.children[0])?;
                let attr = self.globals.index(&tok.children[1].text) as i32;
                ctx.emit(Opcode::GetAttr, attr, 0, 0, tok.pos);
                Ok(())
            }
            "call" => self.compile_call(ctx, tok, 0),
            "func" => self.compile_func_literal(ctx, tok),
            "make" => self.compile_make(ctx, tok),
            "new" => self.compile_new_struct(ctx, tok),
            "mapliteral" => self.compile_map_literal(ctx, tok),
            "sliceliteral" => self.compile_slice_literal(ctx, tok),
            "sliceexpr" => self.compile_slice_expr(ctx, tok),
            _ => Err(CompileError::Internal {
                pos: tok.pos,
                message: format!("cannot compile expression {:?}", tok.symbol),
            }),
        }
    }

    fn compile_name(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        if ctx.locals.exists(&tok.text) {
            let slot = ctx.locals.index(&tok.text) as i32;
            ctx.emit(Opcode::LocalGet, slot, 0, 0, tok.pos);
            return Ok(());
        }
        if self.globals.exists(&tok.text) {
            let slot = self.globals.index(&tok.text) as i32;
            ctx.emit(Opcode::GlobalGet, slot, 0, 0, tok.pos);
            return Ok(());
        }
        // Unresolved at compile time: still reserve a global slot, trusting
        // it to be populated before the surrounding function is called
        // (e.g. a forward-referenced package-level var or a host builtin
        // registered onto the VM after compilation).
        let slot = self.globals.index(&tok.text) as i32;
        ctx.emit(Opcode::GlobalGet, slot, 0, 0, tok.pos);
        Ok(())
    }

    /// `expected_rets` is 0 (unchecked) for ordinary expression contexts and
    /// 1 when the call is the direct rhs of a single-target `:=`/`=`
    /// (spec.md §4.4's multi-return arity check).
    fn compile_call(
        &mut self,
        ctx: &mut FuncCtx,
        tok: &Token,
        expected_rets: i32,
    ) -> Result<(), CompileError> {
        let callee = &tok.children[0];
        let args = &tok.children[1..];
        if callee.symbol == "(name)" {
            match callee.text.as_str() {
                "panic" if args.len() == 1 => {
                    self.compile_expr(ctx, &args[0])?;
                    ctx.emit(Opcode::Panic, 0, 0, 0, tok.pos);
                    return Ok(());
                }
                "len" if args.len() == 1 => {
                    self.compile_expr(ctx, &args[0])?;
                    ctx.emit(Opcode::Len, 0, 0, 0, tok.pos);
                    return Ok(());
                }
                "append" if args.len() == 2 => {
                    self.compile_expr(ctx, &args[0])?;
                    self.compile_expr(ctx, &args[1])?;
                    ctx.emit(Opcode::Append, 0, 0, 0, tok.pos);
                    return Ok(());
                }
                "delete" if args.len() == 2 => {
                    self.compile_expr(ctx, &args[0])?;
                    self.compile_expr(ctx, &args[1])?;
                    ctx.emit(Opcode::Delete, 0, 0, 0, tok.pos);
                    ctx.emit(Opcode::Zero, 0, 0, 0, tok.pos);
                    return Ok(());
                }
                _ => {}
            }
        }
        let mut variadic_tail = false;
        self.compile_expr(ctx, callee)?;
        for a in args {
            if a.symbol == "..." {
                self.compile_expr(ctx, &a.children[0])?;
                variadic_tail = true;
            } else {
                self.compile_expr(ctx, a)?;
            }
        }
        let op = if variadic_tail {
            Opcode::CallVariadic
        } else {
            Opcode::Call
        };
        ctx.emit(op, args.len() as i32, 0, expected_rets, tok.pos);
        Ok(())
    }

    fn compile_func_literal(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let params = &tok.children[1];
        let rets_clause = &tok.children[2];
        let body = &tok.children[3];
        let mut inner = FuncCtx {
            locals: Lookup::new(),
            code: Vec::new(),
            loops: Vec::new(),
            name: format!("lambda@{}", tok.pos),
            arity: params.children.len() as i32,
            variadic: false,
        };
        for p in &params.children {
            let pname = if p.symbol == "(name)" { &p.text } else { &p.children[0].text };
            inner.locals.index(pname);
        }
        for stmt in &body.children {
            self.compile_stmt(&mut inner, stmt)?;
        }
        inner.emit(Opcode::Return, 0, 0, 0, body.pos);
        let rets = func_rets_count(rets_clause, body);
        let idx = self.funcs.len();
        self.funcs.push(FuncChunk {
            code: inner.code,
            num_locals: inner.locals.cap(),
            arity: inner.arity,
            variadic: inner.variadic,
            name: inner.name,
            rets,
        });
        ctx.emit(Opcode::Func, idx as i32, 0, 0, tok.pos);
        Ok(())
    }

    /// Compiles a struct-literal expression `&T{X: 6, ...}` into a
    /// `NewStruct` allocation followed by one `SetAttr` per field, reusing
    /// the existing field-assignment opcode instead of inventing a new one
    /// (spec.md §4.2/§4.4, §8 scenario 3). The fresh struct is stashed in a
    /// synthetic temp local so it can be re-read before each field write
    /// and once more as the literal's own value.
    fn compile_new_struct(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let type_name = tok.child(0).text.clone();
        let fields = tok.child(1);
        let name_idx = self.add_const(Value::string(type_name));
        ctx.emit(Opcode::NewStruct, name_idx, 0, 0, tok.pos);
        let tmp = ctx.locals.index(&format!("$struct@{}", tok.pos)) as i32;
        ctx.emit(Opcode::LocalSet, tmp, 0, 0, tok.pos);
        for kv in &fields.children {
            let key = &kv.children[0];
            let value = &kv.children[1];
            self.compile_expr(ctx, value)?;
            ctx.emit(Opcode::LocalGet, tmp, 0, 0, kv.pos);
            let attr = self.globals.index(&key.text) as i32;
            ctx.emit(Opcode::SetAttr, attr, 0, 0, kv.pos);
        }
        ctx.emit(Opcode::LocalGet, tmp, 0, 0, tok.pos);
        Ok(())
    }

    /// Compiles a map composite literal `map[K]V{k: v, ...}` (spec.md
    /// §3.8/§4.4) by allocating a map then running `Set` per entry, stashed
    /// through the same temp-local pattern as `compile_new_struct`.
    fn compile_map_literal(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let fields = tok.child(1);
        ctx.emit(Opcode::NewMap, 0, 0, 0, tok.pos);
        let tmp = ctx.locals.index(&format!("$map@{}", tok.pos)) as i32;
        ctx.emit(Opcode::LocalSet, tmp, 0, 0, tok.pos);
        for kv in &fields.children {
            let key = &kv.children[0];
            let value = &kv.children[1];
            self.compile_expr(ctx, value)?;
            ctx.emit(Opcode::LocalGet, tmp, 0, 0, kv.pos);
            self.compile_expr(ctx, key)?;
            ctx.emit(Opcode::Set, 0, 0, 0, kv.pos);
        }
        ctx.emit(Opcode::LocalGet, tmp, 0, 0, tok.pos);
        Ok(())
    }

    /// Compiles a slice composite literal `[]T{a, b, ...}` as a fresh slice
    /// grown one `Append` at a time.
    fn compile_slice_literal(
        &mut self,
        ctx: &mut FuncCtx,
        tok: &Token,
    ) -> Result<(), CompileError> {
        let elems = tok.child(1);
        ctx.emit(Opcode::NewSlice, 0, 0, 0, tok.pos);
        let tmp = ctx.locals.index(&format!("$slice@{}", tok.pos)) as i32;
        ctx.emit(Opcode::LocalSet, tmp, 0, 0, tok.pos);
        for el in &elems.children {
            ctx.emit(Opcode::LocalGet, tmp, 0, 0, el.pos);
            self.compile_expr(ctx, el)?;
            ctx.emit(Opcode::Append, 0, 0, 0, el.pos);
            ctx.emit(Opcode::LocalSet, tmp, 0, 0, el.pos);
        }
        ctx.emit(Opcode::LocalGet, tmp, 0, 0, tok.pos);
        Ok(())
    }

    /// Compiles `s[low:high]` (spec.md §4.2's sibling to indexing), filling
    /// an omitted bound with 0 / `len(s)` before emitting the VM's existing
    /// `Slice` opcode.
    fn compile_slice_expr(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let target = &tok.children[0];
        let low = &tok.children[1];
        let high = &tok.children[2];
        self.compile_expr(ctx, target)?;
        let tmp = ctx.locals.index(&format!("$slicetarget@{}", tok.pos)) as i32;
        ctx.emit(Opcode::LocalSet, tmp, 0, 0, tok.pos);
        ctx.emit(Opcode::LocalGet, tmp, 0, 0, tok.pos);
        if low.symbol == "(none)" {
            let idx = self.add_const(Value::untyped_int(0));
            ctx.emit(Opcode::Const, idx, 0, 0, tok.pos);
        } else {
            self.compile_expr(ctx, low)?;
        }
        if high.symbol == "(none)" {
            ctx.emit(Opcode::LocalGet, tmp, 0, 0, tok.pos);
            ctx.emit(Opcode::Len, 0, 0, 0, tok.pos);
        } else {
            self.compile_expr(ctx, high)?;
        }
        ctx.emit(Opcode::Slice, 0, 0, 0, tok.pos);
        Ok(())
    }

    fn compile_make(&mut self, ctx: &mut FuncCtx, tok: &Token) -> Result<(), CompileError> {
        let type_tok = &tok.children[0];
        match type_tok.symbol.as_str() {
            "slicetype" => {
                ctx.emit(Opcode::NewSlice, 0, 0, 0, tok.pos);
                Ok(())
            }
            _ => {
                ctx.emit(Opcode::NewMap, 0, 0, 0, tok.pos);
                Ok(())
            }
        }
    }
}

fn binary_opcode(sym: &str) -> Opcode {
    match sym {
        "+" => Opcode::Add,
        "-" => Opcode::Sub,
        "*" => Opcode::Mul,
        "/" => Opcode::Div,
        "%" => Opcode::Mod,
        "<" => Opcode::Lt,
        "<=" => Opcode::Lte,
        ">" => Opcode::Gt,
        ">=" => Opcode::Gte,
        "==" => Opcode::Eq,
        "!=" => Opcode::Neq,
        "&&" => Opcode::And,
        "||" => Opcode::Or,
        "&" => Opcode::BitAnd,
        "|" => Opcode::BitOr,
        "^" => Opcode::BitXor,
        "<<" => Opcode::BitLsh,
        ">>" => Opcode::BitRsh,
        _ => unreachable!(),
    }
}

/// Two-pass peephole optimizer: fuses short, frequent instruction
/// sequences into specialized opcodes. Idempotent — running it twice in a
/// row produces the same output as running it once, since every fusion
/// rule only ever shortens a matched window and never re-introduces the
/// pattern it consumed.
pub fn optimize_chunk(code: &mut Vec<Instruction>) {
    loop {
        let before = code.len();
        fuse_local_incdec(code);
        fuse_local_arith(code);
        if code.len() == before {
            break;
        }
    }
}

fn fuse_local_incdec(code: &mut Vec<Instruction>) {
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        if i + 2 < code.len()
            && code[i].op == Opcode::LocalGet
            && code[i + 1].op == Opcode::IncDec
            && code[i + 2].op == Opcode::LocalSet
            && code[i].a == code[i + 2].a
        {
            out.push(Instruction::new(
                Opcode::LocalIncDec,
                code[i].a,
                code[i + 1].a,
                0,
                code[i].pos,
            ));
            i += 3;
            continue;
        }
        out.push(code[i]);
        i += 1;
    }
    *code = out;
}

fn fuse_local_arith(code: &mut Vec<Instruction>) {
    let mut out = Vec::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        if i + 3 < code.len()
            && code[i].op == Opcode::LocalGet
            && matches!(
                code[i + 1].op,
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div
            )
            && code[i + 2].op == Opcode::LocalSet
            && code[i].a == code[i + 2].a
        {
            // only fuse when the value being combined was already on the
            // stack from a prior instruction (a pure `x = x OP y` form)
            let fused = match code[i + 1].op {
                Opcode::Add => Opcode::LocalAdd,
                Opcode::Sub => Opcode::LocalSub,
                Opcode::Mul => Opcode::LocalMul,
                Opcode::Div => Opcode::LocalDiv,
                _ => unreachable!(),
            };
            out.push(Instruction::new(fused, code[i].a, 0, 0, code[i].pos));
            i += 3;
            continue;
        }
        out.push(code[i]);
        i += 1;
    }
    *code = out;
}

