//! Top-down operator precedence (Pratt) parser. Grounded on
//! `examples/original_source/parse.go` and `symbol.go`: a per-symbol
//! `{lbp, nud, led}` table drives both the main expression loop and every
//! statement-level construct (statements are parsed via a symbol's `nud`
//! the same as expressions — `if`, `for`, `func` etc. are just symbols with
//! no `led`).

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::ParseError;
use crate::token::{Position, Token};

type NudFn = fn(&mut Parser) -> Result<Token, ParseError>;
type LedFn = fn(&mut Parser, Token) -> Result<Token, ParseError>;

#[derive(Clone, Copy)]
struct Symbol {
    lbp: i32,
    nud: Option<NudFn>,
    led: Option<LedFn>,
}

const NOBP: i32 = 0;

fn sym(lbp: i32, nud: Option<NudFn>, led: Option<LedFn>) -> Symbol {
    Symbol { lbp, nud, led }
}

lazy_static! {
    static ref SYMBOLS: HashMap<&'static str, Symbol> = {
        let mut m = HashMap::new();
        m.insert("(eof)", sym(NOBP, None, None));
        m.insert("(name)", sym(NOBP, Some(name_nud), None));
        m.insert("(int)", sym(NOBP, Some(literal_nud), None));
        m.insert("(float)", sym(NOBP, Some(literal_nud), None));
        m.insert("(string)", sym(NOBP, Some(literal_nud), None));
        m.insert("(char)", sym(NOBP, Some(literal_nud), None));
        m.insert("true", sym(NOBP, Some(literal_nud), None));
        m.insert("false", sym(NOBP, Some(literal_nud), None));
        m.insert("nil", sym(NOBP, Some(literal_nud), None));

        m.insert("=", sym(10, None, Some(assign_led)));
        m.insert(":=", sym(10, None, Some(assign_led)));
        m.insert("+=", sym(10, None, Some(assign_led)));
        m.insert("-=", sym(10, None, Some(assign_led)));
        m.insert("*=", sym(10, None, Some(assign_led)));
        m.insert("/=", sym(10, None, Some(assign_led)));

        m.insert(",", sym(20, None, Some(comma_led)));

        m.insert("||", sym(30, None, Some(binary_led)));
        m.insert("&&", sym(40, None, Some(binary_led)));

        m.insert("==", sym(50, None, Some(binary_led)));
        m.insert("!=", sym(50, None, Some(binary_led)));
        m.insert("<", sym(50, None, Some(binary_led)));
        m.insert("<=", sym(50, None, Some(binary_led)));
        m.insert(">", sym(50, None, Some(binary_led)));
        m.insert(">=", sym(50, None, Some(binary_led)));

        m.insert("|", sym(60, None, Some(binary_led)));
        m.insert("^", sym(60, None, Some(binary_led)));
        m.insert("&", sym(70, Some(addr_nud), Some(binary_led)));

        m.insert("<<", sym(80, None, Some(binary_led)));
        m.insert(">>", sym(80, None, Some(binary_led)));

        m.insert("+", sym(90, Some(unary_nud), Some(binary_led)));
        m.insert("-", sym(90, Some(unary_nud), Some(binary_led)));

        m.insert("*", sym(100, Some(unary_nud), Some(binary_led)));
        m.insert("/", sym(100, None, Some(binary_led)));
        m.insert("%", sym(100, None, Some(binary_led)));

        m.insert("!", sym(NOBP, Some(unary_nud), None));
        m.insert("~", sym(NOBP, Some(unary_nud), None));

        m.insert("++", sym(110, None, Some(postfix_led)));
        m.insert("--", sym(110, None, Some(postfix_led)));

        m.insert(".", sym(120, None, Some(dot_led)));
        m.insert("(", sym(120, Some(paren_nud), Some(call_led)));
        m.insert("[", sym(120, Some(slice_literal_nud), Some(index_led)));
        m.insert(")", sym(NOBP, None, None));
        m.insert("]", sym(NOBP, None, None));
        m.insert("}", sym(NOBP, None, None));
        m.insert("{", sym(NOBP, Some(block_nud), None));
        m.insert(";", sym(NOBP, None, None));
        m.insert(":", sym(NOBP, None, None));

        m.insert("func", sym(NOBP, Some(func_nud), None));
        m.insert("return", sym(NOBP, Some(return_nud), None));
        m.insert("if", sym(NOBP, Some(if_nud), None));
        m.insert("else", sym(NOBP, None, None));
        m.insert("for", sym(NOBP, Some(for_nud), None));
        m.insert("range", sym(NOBP, None, None));
        m.insert("break", sym(NOBP, Some(leaf_nud), None));
        m.insert("continue", sym(NOBP, Some(leaf_nud), None));
        m.insert("var", sym(NOBP, Some(var_nud), None));
        m.insert("const", sym(NOBP, Some(const_nud), None));
        m.insert("type", sym(NOBP, Some(type_nud), None));
        m.insert("struct", sym(NOBP, None, None));
        m.insert("interface", sym(NOBP, None, None));
        m.insert("package", sym(NOBP, Some(package_nud), None));
        m.insert("import", sym(NOBP, Some(import_nud), None));
        m.insert("switch", sym(NOBP, Some(switch_nud), None));
        m.insert("case", sym(NOBP, None, None));
        m.insert("default", sym(NOBP, None, None));
        m.insert("make", sym(NOBP, Some(make_nud), None));
        m.insert("map", sym(NOBP, Some(maptype_nud), None));

        m
    };
}

fn lookup_symbol(sym: &str) -> Symbol {
    SYMBOLS
        .get(sym)
        .copied()
        .unwrap_or(Symbol { lbp: NOBP, nud: Some(name_nud), led: None })
}

/// Whether the lexer should treat `sym` as a registered multi-character
/// punctuation symbol or keyword rather than falling back to `"(name)"`.
pub fn is_known_symbol(sym: &str) -> bool {
    SYMBOLS.contains_key(sym) || sym == "..."
}

pub struct Parser {
    tokens: Vec<Token>,
    n: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Parser {
        Parser { tokens, n: 0 }
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.n]
    }

    fn pos(&self) -> Position {
        self.cur().pos
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.n].clone();
        if self.n + 1 < self.tokens.len() {
            self.n += 1;
        }
        t
    }

    fn expect(&mut self, symbol: &str) -> Result<Token, ParseError> {
        if self.cur().symbol != symbol {
            return Err(ParseError::AdvanceMismatch {
                pos: self.pos(),
                expected: symbol.to_string(),
                found: self.cur().symbol.clone(),
            });
        }
        Ok(self.advance())
    }

    fn at(&self, symbol: &str) -> bool {
        self.cur().symbol == symbol
    }

    fn skip_terminators(&mut self) {
        while self.at(";") {
            self.advance();
        }
    }

    fn expression(&mut self, rbp: i32) -> Result<Token, ParseError> {
        let t = self.advance();
        let sym = lookup_symbol(&t.symbol);
        let nud = sym.nud.ok_or_else(|| ParseError::NullNud {
            pos: t.pos,
            symbol: t.symbol.clone(),
        })?;
        let mut left = nud(self)?;
        loop {
            let cur_sym = lookup_symbol(&self.cur().symbol);
            if rbp >= cur_sym.lbp {
                break;
            }
            let tok = self.advance();
            let led = match cur_sym.led {
                Some(l) => l,
                None => {
                    return Err(ParseError::NullLed {
                        pos: tok.pos,
                        symbol: tok.symbol,
                    })
                }
            };
            left = led(self, left)?;
        }
        Ok(left)
    }

    /// Parses one statement (which, in this grammar, is just an expression
    /// parsed at the lowest binding power — declarations, control flow,
    /// and plain expression-statements are unified through `nud`).
    fn statement(&mut self) -> Result<Token, ParseError> {
        self.expression(NOBP)
    }

    fn block(&mut self) -> Result<Token, ParseError> {
        let open = self.expect("{")?;
        let mut node = Token::new(open.pos, "block", "block");
        self.skip_terminators();
        while !self.at("}") && !self.at("(eof)") {
            node.push_child(self.statement()?);
            self.skip_terminators();
        }
        self.expect("}")?;
        Ok(node)
    }

    /// Parses a whole source file into a `(file)` tree (spec.md §4.2's
    /// top-level entry point).
    pub fn parse_file(mut self) -> Result<Token, ParseError> {
        self.skip_terminators();
        let mut file = Token::new(self.pos(), "(file)", "(file)");
        while !self.at("(eof)") {
            file.push_child(self.statement()?);
            self.skip_terminators();
        }
        Ok(file)
    }
}

fn leaf_nud(p: &mut Parser) -> Result<Token, ParseError> {
    Ok(p.tokens[p.n - 1].clone())
}

fn literal_nud(p: &mut Parser) -> Result<Token, ParseError> {
    leaf_nud(p)
}

fn name_nud(p: &mut Parser) -> Result<Token, ParseError> {
    leaf_nud(p)
}

fn unary_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    let mut node = Token::new(op.pos, format!("u{}", op.symbol), op.text.clone());
    node.push_child(p.expression(95)?);
    Ok(node)
}

fn binary_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    let bp = lookup_symbol(&op.symbol).lbp;
    let mut node = Token::new(op.pos, op.symbol.clone(), op.text.clone());
    node.push_child(left);
    node.push_child(p.expression(bp)?);
    Ok(node)
}

fn postfix_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    let mut node = Token::new(op.pos, op.symbol.clone(), op.text.clone());
    node.push_child(left);
    Ok(node)
}

fn comma_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    let mut node = Token::new(op.pos, ",", ",");
    node.push_child(left);
    node.push_child(p.expression(20)?);
    Ok(node)
}

fn assign_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    let mut node = Token::new(op.pos, op.symbol.clone(), op.text.clone());
    node.push_child(left);
    node.push_child(p.expression(9)?);
    Ok(node)
}

fn dot_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let dot = p.tokens[p.n - 1].clone();
    let name = p.advance();
    let mut node = Token::new(dot.pos, ".", ".");
    node.push_child(left);
    node.push_child(name);
    Ok(node)
}

/// Also covers slice-expressions (`s[a:b]`, `s[:b]`, `s[a:]`, `s[:]`),
/// spec.md §4.2's sibling to indexing: once a bare `:` shows up before the
/// closing `]`, this produces a `"sliceexpr"` node `[target, low, high]`
/// where an omitted bound becomes a `"(none)"` placeholder leaf.
fn index_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let open = p.tokens[p.n - 1].clone();
    if p.at(":") {
        p.advance();
        let mut node = Token::new(open.pos, "sliceexpr", "[");
        node.push_child(left);
        node.push_child(Token::new(open.pos, "(none)", ""));
        node.push_child(if p.at("]") {
            Token::new(open.pos, "(none)", "")
        } else {
            p.expression(NOBP)?
        });
        p.expect("]")?;
        return Ok(node);
    }
    let first = p.expression(NOBP)?;
    if p.at(":") {
        p.advance();
        let mut node = Token::new(open.pos, "sliceexpr", "[");
        node.push_child(left);
        node.push_child(first);
        node.push_child(if p.at("]") {
            Token::new(open.pos, "(none)", "")
        } else {
            p.expression(NOBP)?
        });
        p.expect("]")?;
        return Ok(node);
    }
    let mut node = Token::new(open.pos, "index", "[");
    node.push_child(left);
    node.push_child(first);
    p.expect("]")?;
    Ok(node)
}

/// `&Name{...}` is a struct-literal expression (spec.md §4.4): the address-of
/// operator doubles as the struct-literal entry point, matching how this
/// grammar routes `make`/slice-literals through their own leading keyword.
/// Any other operand falls back to a plain prefix reference.
fn addr_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let op = p.tokens[p.n - 1].clone();
    if p.cur().symbol == "(name)" && p.tokens.get(p.n + 1).map(|t| t.symbol.as_str()) == Some("{")
    {
        let name = p.advance();
        let fields = p.composite_fields()?;
        let mut node = Token::new(op.pos, "new", "&");
        node.push_child(name);
        node.push_child(fields);
        return Ok(node);
    }
    let mut node = Token::new(op.pos, "u&", op.text.clone());
    node.push_child(p.expression(95)?);
    Ok(node)
}

/// `map[K]V` type syntax, optionally followed by a `{...}` composite
/// literal (spec.md §3.8/§4.4). Produces a bare `"maptype"` node `[key,
/// value]` for type position, or a `"mapliteral"` node `[maptype, fields]`
/// when entries follow.
fn maptype_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    p.expect("[")?;
    let key_type = p.expression(NOBP)?;
    p.expect("]")?;
    let value_type = p.expression(20)?;
    let mut mtype = Token::new(kw.pos, "maptype", "map");
    mtype.push_child(key_type);
    mtype.push_child(value_type);
    if p.at("{") {
        let fields = p.composite_fields()?;
        let mut node = Token::new(kw.pos, "mapliteral", "map");
        node.push_child(mtype);
        node.push_child(fields);
        return Ok(node);
    }
    Ok(mtype)
}

/// `[` at the start of an expression starts a slice-type expression
/// (`[]T`, used in type position); this crate's Pratt loop routes it the
/// same as a normal prefix symbol.
fn slice_literal_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let open = p.tokens[p.n - 1].clone();
    let mut node = Token::new(open.pos, "slicetype", "[]");
    p.expect("]")?;
    node.push_child(p.expression(NOBP)?);
    if p.at("{") {
        let elems = p.slice_literal_elems()?;
        let mut lit = Token::new(open.pos, "sliceliteral", "[]");
        lit.push_child(node);
        lit.push_child(elems);
        return Ok(lit);
    }
    Ok(node)
}

impl Parser {
    /// Parses `{ key: value, ... }` entries shared by struct literals
    /// (`&T{X: 6}`) and map literals (`map[int]int{10: 30}`) — both reduce
    /// to the same `"kv"` two-child shape, a struct field key just happens
    /// to always be an identifier.
    fn composite_fields(&mut self) -> Result<Token, ParseError> {
        let open = self.expect("{")?;
        let mut node = Token::new(open.pos, "fields", "fields");
        self.skip_terminators();
        while !self.at("}") {
            let key = self.expression(20)?;
            self.expect(":")?;
            let value = self.expression(20)?;
            let mut kv = Token::new(key.pos, "kv", "kv");
            kv.push_child(key);
            kv.push_child(value);
            node.push_child(kv);
            if self.at(",") {
                self.advance();
            }
            self.skip_terminators();
        }
        self.expect("}")?;
        Ok(node)
    }

    /// Parses `{ elem, elem, ... }` entries for slice composite literals.
    fn slice_literal_elems(&mut self) -> Result<Token, ParseError> {
        let open = self.expect("{")?;
        let mut node = Token::new(open.pos, "elems", "elems");
        self.skip_terminators();
        while !self.at("}") {
            node.push_child(self.expression(20)?);
            if self.at(",") {
                self.advance();
            }
            self.skip_terminators();
        }
        self.expect("}")?;
        Ok(node)
    }
}

fn paren_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let inner = p.expression(NOBP)?;
    p.expect(")")?;
    Ok(inner)
}

fn call_led(p: &mut Parser, left: Token) -> Result<Token, ParseError> {
    let open = p.tokens[p.n - 1].clone();
    let mut node = Token::new(open.pos, "call", "(");
    node.push_child(left);
    if !p.at(")") {
        loop {
            let mut arg = p.expression(20)?;
            if p.at("...") {
                p.advance();
                let mut variadic = Token::new(arg.pos, "...", "...");
                variadic.push_child(arg);
                arg = variadic;
            }
            node.push_child(arg);
            if p.at(",") {
                p.advance();
                continue;
            }
            break;
        }
    }
    p.expect(")")?;
    Ok(node)
}

fn block_nud(p: &mut Parser) -> Result<Token, ParseError> {
    p.n -= 1;
    p.block()
}

/// Receiver-style method declarations (spec.md §4.2/§4.4: `func (t *T)
/// M(...) { ... }`) are disambiguated from an anonymous function literal
/// `func (params) { ... }` by trying to parse the leading group as a
/// receiver spec (`name type`) followed by a method name; on any mismatch
/// the parser rewinds and falls through to the ordinary function path.
fn func_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();

    if p.at("(") {
        let save = p.n;
        if let Some(recv) = try_parse_receiver(p)? {
            if p.cur().symbol == "(name)" {
                let name = p.advance();
                let params = p.param_list()?;
                let rets = p.return_clause()?;
                let body = p.block()?;
                let mut node = Token::new(kw.pos, "method", "method");
                node.push_child(name);
                node.push_child(recv);
                node.push_child(params);
                node.push_child(rets);
                node.push_child(body);
                return Ok(node);
            }
        }
        p.n = save;
    }

    let mut node = Token::new(kw.pos, "func", "func");
    if p.cur().symbol == "(name)" && p.tokens.get(p.n + 1).map(|t| t.symbol.as_str()) != Some("(")
    {
        node.push_child(p.advance());
    } else {
        node.push_child(Token::new(kw.pos, "(name)", ""));
    }
    let params = p.param_list()?;
    node.push_child(params);
    let rets = p.return_clause()?;
    node.push_child(rets);
    let body = p.block()?;
    node.push_child(body);
    Ok(node)
}

/// Tries to parse `( name *T )` or `( name T )` as a method receiver spec.
/// Returns `None` (without necessarily restoring `p.n` — callers rewind
/// themselves) the moment the tokens don't fit that shape.
fn try_parse_receiver(p: &mut Parser) -> Result<Option<Token>, ParseError> {
    if !p.at("(") {
        return Ok(None);
    }
    p.advance();
    if p.cur().symbol != "(name)" {
        return Ok(None);
    }
    let recv_name = p.advance();
    let recv_type = if p.at("*") {
        p.advance();
        if p.cur().symbol != "(name)" {
            return Ok(None);
        }
        let tname = p.advance();
        let mut t = Token::new(tname.pos, "u*", "*");
        t.push_child(tname);
        t
    } else if p.cur().symbol == "(name)" {
        p.advance()
    } else {
        return Ok(None);
    };
    if !p.at(")") {
        return Ok(None);
    }
    p.advance();
    let mut spec = Token::new(recv_name.pos, "spec", "spec");
    spec.push_child(recv_name);
    spec.push_child(recv_type);
    Ok(Some(spec))
}

impl Parser {
    fn param_list(&mut self) -> Result<Token, ParseError> {
        let open = self.expect("(")?;
        let mut params = Token::new(open.pos, "params", "params");
        while !self.at(")") {
            params.push_child(self.param_spec()?);
            if self.at(",") {
                self.advance();
            }
        }
        self.expect(")")?;
        Ok(params)
    }

    /// One parameter: a bare name, or `name type` (the type is parsed and
    /// discarded at this dynamically-typed VM's compile stage, same as
    /// `var_spec`'s optional type).
    fn param_spec(&mut self) -> Result<Token, ParseError> {
        let name = self.expect("(name)")?;
        let mut spec = Token::new(name.pos, "spec", "spec");
        spec.push_child(name);
        if !self.at(",") && !self.at(")") {
            spec.push_child(self.expression(20)?);
        }
        Ok(spec)
    }

    /// Parses an optional return-type clause between a function's `)` and
    /// its body `{`: nothing, a single bare type, or a parenthesized list.
    /// The clause's arity (not its types, which are discarded) becomes
    /// `FuncChunk::rets`.
    fn return_clause(&mut self) -> Result<Token, ParseError> {
        let pos = self.pos();
        let mut rets = Token::new(pos, "rets", "rets");
        if self.at("{") {
            return Ok(rets);
        }
        if self.at("(") {
            self.advance();
            while !self.at(")") {
                rets.push_child(self.expression(20)?);
                if self.at(",") {
                    self.advance();
                }
            }
            self.expect(")")?;
        } else {
            rets.push_child(self.expression(20)?);
        }
        Ok(rets)
    }
}

fn return_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let mut node = Token::new(kw.pos, "return", "return");
    if !p.at(";") && !p.at("}") {
        loop {
            node.push_child(p.expression(20)?);
            if p.at(",") {
                p.advance();
                continue;
            }
            break;
        }
    }
    Ok(node)
}

fn if_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let mut node = Token::new(kw.pos, "if", "if");
    node.push_child(p.expression(NOBP)?);
    node.push_child(p.block()?);
    if p.at("else") {
        p.advance();
        if p.at("if") {
            p.advance();
            node.push_child(if_nud(p)?);
        } else {
            node.push_child(p.block()?);
        }
    }
    Ok(node)
}

/// Covers all four `for` shapes from spec.md §4.2: bare `for { }`,
/// condition-only `for cond { }`, C-style `for init; cond; post { }`, and
/// `for k, v := range x { }`.
fn for_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();

    if p.at("{") {
        let mut node = Token::new(kw.pos, "for", "for");
        node.push_child(p.block()?);
        return Ok(node);
    }

    let save = p.n;
    if let Some(range_node) = try_parse_range_for(p, &kw)? {
        return Ok(range_node);
    }
    p.n = save;

    let first = p.expression(NOBP)?;
    if p.at("{") {
        let mut node = Token::new(kw.pos, "forcond", "for");
        node.push_child(first);
        node.push_child(p.block()?);
        return Ok(node);
    }
    p.expect(";")?;
    let cond = if p.at(";") {
        Token::new(kw.pos, "true", "true")
    } else {
        p.expression(NOBP)?
    };
    p.expect(";")?;
    let post = p.expression(NOBP)?;
    let mut node = Token::new(kw.pos, "forc", "for");
    node.push_child(first);
    node.push_child(cond);
    node.push_child(post);
    node.push_child(p.block()?);
    Ok(node)
}

fn try_parse_range_for(p: &mut Parser, kw: &Token) -> Result<Option<Token>, ParseError> {
    let mut names = Vec::new();
    if p.cur().symbol != "(name)" {
        return Ok(None);
    }
    names.push(p.advance());
    if p.at(",") {
        p.advance();
        if p.cur().symbol != "(name)" {
            return Ok(None);
        }
        names.push(p.advance());
    }
    if !p.at(":=") && !p.at("=") {
        return Ok(None);
    }
    p.advance();
    if !p.at("range") {
        return Ok(None);
    }
    p.advance();
    let iterable = p.expression(NOBP)?;
    let mut node = Token::new(kw.pos, "forrange", "for");
    let mut names_node = Token::new(kw.pos, "names", "names");
    for n in names {
        names_node.push_child(n);
    }
    node.push_child(names_node);
    node.push_child(iterable);
    node.push_child(p.block()?);
    Ok(Some(node))
}

fn var_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let mut node = Token::new(kw.pos, kw.symbol.clone(), kw.text.clone());
    if p.at("(") {
        p.advance();
        p.skip_terminators();
        while !p.at(")") {
            node.push_child(p.var_spec()?);
            p.skip_terminators();
        }
        p.expect(")")?;
    } else {
        node.push_child(p.var_spec()?);
    }
    Ok(node)
}

impl Parser {
    fn var_spec(&mut self) -> Result<Token, ParseError> {
        let name = self.expect("(name)")?;
        let mut spec = Token::new(name.pos, "spec", "spec");
        spec.push_child(name);
        if !self.at("=") && !self.at(";") && !self.at(")") {
            spec.push_child(self.expression(20)?);
        }
        if self.at("=") {
            self.advance();
            spec.push_child(self.expression(20)?);
        }
        Ok(spec)
    }
}

/// `const (...)` groups with `iota` substitution (spec.md §4.2): each spec
/// without its own initializer repeats the previous spec's expression with
/// `iota` re-substituted for the new row's index, matching Go's const-group
/// semantics.
fn const_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let mut node = Token::new(kw.pos, "const", "const");
    if p.at("(") {
        p.advance();
        p.skip_terminators();
        let mut iota: i64 = 0;
        let mut last_expr: Option<Token> = None;
        while !p.at(")") {
            let name = p.expect("(name)")?;
            let mut spec = Token::new(name.pos, "spec", "spec");
            spec.push_child(name.clone());
            let expr = if !p.at(";") && !p.at(")") {
                let e = p.expression(20)?;
                let e = substitute_iota(&e, iota);
                last_expr = Some(e.clone());
                e
            } else if let Some(prev) = &last_expr {
                substitute_iota(prev, iota)
            } else {
                Token::new(name.pos, "(int)", "0")
            };
            spec.push_child(expr);
            node.push_child(spec);
            iota += 1;
            p.skip_terminators();
        }
        p.expect(")")?;
    } else {
        node.push_child(p.var_spec()?);
    }
    Ok(node)
}

/// Replaces every `iota` identifier leaf in `t` with an `(int)` literal.
fn substitute_iota(t: &Token, iota: i64) -> Token {
    if t.symbol == "(name)" && t.text == "iota" {
        return Token::new(t.pos, "(int)", iota.to_string());
    }
    let mut node = Token::new(t.pos, t.symbol.clone(), t.text.clone());
    for c in &t.children {
        node.push_child(substitute_iota(c, iota));
    }
    node
}

fn type_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let name = p.expect("(name)")?;
    let mut node = Token::new(kw.pos, "type", "type");
    node.push_child(name);
    if p.at("struct") {
        p.advance();
        p.expect("{")?;
        let mut fields = Token::new(kw.pos, "fields", "fields");
        p.skip_terminators();
        while !p.at("}") {
            let fname = p.expect("(name)")?;
            let ftype = p.expression(20)?;
            let mut field = Token::new(fname.pos, "field", "field");
            field.push_child(fname);
            field.push_child(ftype);
            fields.push_child(field);
            p.skip_terminators();
        }
        p.expect("}")?;
        node.push_child(fields);
    } else if p.at("interface") {
        p.advance();
        p.expect("{")?;
        let mut methods = Token::new(kw.pos, "methods", "methods");
        p.skip_terminators();
        while !p.at("}") {
            let mname = p.expect("(name)")?;
            skip_balanced(p, "(", ")");
            if p.at("(") {
                skip_balanced(p, "(", ")");
            } else {
                while !p.at(";") && !p.at("}") && !p.at("(eof)") {
                    p.advance();
                }
            }
            let mut m = Token::new(mname.pos, "methodsig", "methodsig");
            m.push_child(mname);
            methods.push_child(m);
            p.skip_terminators();
        }
        p.expect("}")?;
        node.push_child(methods);
    } else {
        node.push_child(p.expression(20)?);
    }
    Ok(node)
}

/// Skips one balanced `open`/`close` group, assuming the parser is
/// currently positioned at `open`. Used to discard interface method
/// signatures (spec.md §4.4 scopes interfaces to name collection only, the
/// VM already dispatches on duck-typed struct field/method lookup).
fn skip_balanced(p: &mut Parser, open: &str, close: &str) {
    if !p.at(open) {
        return;
    }
    let mut depth = 0;
    loop {
        if p.at(open) {
            depth += 1;
        } else if p.at(close) {
            depth -= 1;
        }
        p.advance();
        if depth == 0 {
            break;
        }
    }
}

fn package_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let name = p.expect("(name)")?;
    let mut node = Token::new(kw.pos, "package", "package");
    node.push_child(name);
    Ok(node)
}

fn import_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let path = p.expect("(string)")?;
    let mut node = Token::new(kw.pos, "import", "import");
    node.push_child(path);
    Ok(node)
}

fn switch_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    let mut node = Token::new(kw.pos, "switch", "switch");
    if !p.at("{") {
        node.push_child(p.expression(NOBP)?);
    } else {
        node.push_child(Token::new(kw.pos, "true", "true"));
    }
    p.expect("{")?;
    p.skip_terminators();
    while p.at("case") || p.at("default") {
        node.push_child(p.switch_case()?);
        p.skip_terminators();
    }
    p.expect("}")?;
    Ok(node)
}

impl Parser {
    fn switch_case(&mut self) -> Result<Token, ParseError> {
        let is_default = self.at("default");
        let kw = self.advance();
        let mut case = Token::new(kw.pos, if is_default { "default" } else { "case" }, "case");
        if !is_default {
            loop {
                case.push_child(self.expression(20)?);
                if self.at(",") {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(":")?;
        let mut body = Token::new(kw.pos, "block", "block");
        self.skip_terminators();
        while !self.at("case") && !self.at("default") && !self.at("}") {
            body.push_child(self.statement()?);
            self.skip_terminators();
        }
        case.push_child(body);
        Ok(case)
    }
}

fn make_nud(p: &mut Parser) -> Result<Token, ParseError> {
    let kw = p.tokens[p.n - 1].clone();
    p.expect("(")?;
    let mut node = Token::new(kw.pos, "make", "make");
    node.push_child(p.expression(20)?);
    while p.at(",") {
        p.advance();
        node.push_child(p.expression(20)?);
    }
    p.expect(")")?;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn known(s: &str) -> bool {
        lookup_symbol(s).nud.is_some() || lookup_symbol(s).led.is_some() || s == "..."
    }

    fn parse_expr(src: &str) -> Token {
        let tokens = Lexer::new(src, 0, &known).tokenize().unwrap();
        let mut p = Parser::new(tokens);
        p.expression(NOBP).unwrap()
    }

    #[test]
    fn precedence_respects_mul_over_add() {
        let t = parse_expr("1 + 2 * 3");
        assert_eq!(t.to_string(), "(+ 1 (* 2 3))");
    }

    #[test]
    fn left_associative_subtraction() {
        let t = parse_expr("1 - 2 - 3");
        assert_eq!(t.to_string(), "(- (- 1 2) 3)");
    }

    #[test]
    fn parens_override_precedence() {
        let t = parse_expr("(1 + 2) * 3");
        assert_eq!(t.to_string(), "(* (+ 1 2) 3)");
    }

    #[test]
    fn call_and_dot_chain() {
        let t = parse_expr("a.b(1, 2)");
        assert_eq!(t.symbol, "call");
        assert_eq!(t.children[0].symbol, ".");
    }

    #[test]
    fn if_else_if_chain() {
        let tokens = Lexer::new("if a { } else if b { } else { }", 0, &known)
            .tokenize()
            .unwrap();
        let mut p = Parser::new(tokens);
        let t = p.statement().unwrap();
        assert_eq!(t.symbol, "if");
        assert_eq!(t.children.len(), 3);
        assert_eq!(t.children[2].symbol, "if");
    }

    #[test]
    fn c_style_for_loop() {
        let tokens = Lexer::new("for i := 0; i < 10; i = i + 1 { }", 0, &known)
            .tokenize()
            .unwrap();
        let mut p = Parser::new(tokens);
        let t = p.statement().unwrap();
        assert_eq!(t.symbol, "forc");
        assert_eq!(t.children.len(), 4);
    }

    #[test]
    fn range_for_loop() {
        let tokens = Lexer::new("for k, v := range xs { }", 0, &known)
            .tokenize()
            .unwrap();
        let mut p = Parser::new(tokens);
        let t = p.statement().unwrap();
        assert_eq!(t.symbol, "forrange");
    }
}
