//! The tagged uniform value type and its numeric/compound type lattice.
//! Grounded on `examples/original_source/value.go`; the bit layout matches
//! exactly so external dumps and internal reasoning about `mix_type` stay
//! consistent with the reference semantics in spec.md §3.5-§3.8.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::intmap::IntMap;

pub type Type = u32;

pub const TYPE_NIL: Type = 0b0000_0000;
pub const UNTYPED_INT: Type = 0b0000_0001;
pub const IS_NUMERIC_MASK: Type = 0b0000_0011;
pub const SIGNED_NUMBER_MASK: Type = 0b0001_0000;
pub const TYPE_UINT8: Type = 0b0000_0011;
pub const TYPE_INT8: Type = 0b0001_0011;
pub const TYPE_UINT32: Type = 0b0000_0111;
pub const TYPE_INT32: Type = 0b0001_0111;
pub const TYPE_FLOAT64: Type = 0b0001_1111;
pub const TYPE_TYPE: Type = 0b0000_0100;
pub const TYPE_NEXT: Type = 0b0000_1000;
pub const TYPE_BOOL: Type = 0b0010_0000;
pub const TYPE_STRING: Type = 0b0100_0000;
pub const TYPE_OBJECT: Type = 0b0110_0000;
pub const NILLABLE_MIN: Type = 0b1000_0000;
pub const TYPE_SLICE: Type = 0b1000_0000;
pub const TYPE_MAP: Type = 0b1010_0000;
pub const TYPE_FUNC: Type = 0b1100_0000;
pub const TYPE_STRUCT: Type = 0b1110_0000;

pub const TYPE_MASK: Type = 0xff;
pub const TYPE_SHIFT: u32 = 8;

pub fn base(t: Type) -> Type {
    t & TYPE_MASK
}

pub fn type_value(t: Type) -> Type {
    t >> TYPE_SHIFT
}

pub fn type_pair(t: Type) -> (Type, Type) {
    ((t >> TYPE_SHIFT) & TYPE_MASK, t >> (TYPE_SHIFT * 2))
}

pub fn slice_type(value: Type) -> Type {
    (value << TYPE_SHIFT) | TYPE_SLICE
}

pub fn map_type(key: Type, value: Type) -> Type {
    (value << (TYPE_SHIFT * 2)) | (key << TYPE_SHIFT) | TYPE_MAP
}

pub fn struct_type(index: Type) -> Type {
    (index << TYPE_SHIFT) | TYPE_STRUCT
}

fn is_safe_str(t: Type) -> bool {
    !matches!(base(t), TYPE_SLICE | TYPE_MAP | TYPE_STRUCT)
}

/// The uniform runtime value: a type tag, a packed numeric payload (used by
/// every scalar type and as the struct-type index), and an optional
/// reference-counted object for heap-shaped data (strings, slices, maps,
/// structs, functions, iterators).
#[derive(Clone)]
pub struct Value {
    pub tag: Type,
    pub num: f64,
    pub obj: Option<Rc<Obj>>,
}

impl Default for Value {
    fn default() -> Self {
        Value {
            tag: TYPE_NIL,
            num: 0.0,
            obj: None,
        }
    }
}

/// The heap-shaped object kinds a `Value` may point to. A single enum plays
/// the role of the Go original's `Object` interface plus its handful of
/// concrete implementations (`stringT`, `sliceT`, `stringMap`,
/// `numericMap`, `structT`, `funcT`, `nextT`) — idiomatic Rust prefers one
/// closed sum type at this seam over a dyn-dispatched capability trait,
/// since every variant here is owned by this crate. The two original Go map
/// kinds collapse into a single `StringMap` keyed by canonical string, since
/// this crate's key type is never known until the first `Set`.
pub enum Obj {
    Str(String),
    Slice(RefCell<SliceObj>),
    StringMap(RefCell<StringMapObj>),
    Struct(RefCell<StructObj>),
    Func(FuncObj),
    Next(RefCell<Box<dyn FnMut() -> Option<(Value, Value)>>>),
    Host(Rc<dyn std::any::Any>),
}

pub struct SliceObj {
    pub value_type: Type,
    pub data: Vec<Value>,
}

/// A single map representation for every key type the language exposes.
/// Keyed by a canonical string derived from the key's `Display` form (an
/// int `10` and the string `"10"` alias, which is never observable since a
/// map's key type is fixed for its lifetime); `data` carries the original
/// key `Value` alongside the stored value so iteration yields keys typed
/// the way they went in.
pub struct StringMapObj {
    pub value_type: Type,
    pub data: FxHashMap<String, (Value, Value)>,
    pub keys: Vec<String>,
}

pub struct StructObj {
    pub type_n: i32,
    pub lookup: FxHashMap<String, usize>,
    pub fields: IntMap,
    pub methods: Rc<RefCell<IntMap>>,
}

#[derive(Clone)]
pub struct FuncObj {
    pub args: i32,
    pub rets: i32,
    pub variadic: bool,
    pub body: FuncBody,
}

#[derive(Clone)]
pub enum FuncBody {
    /// An index into the compiled program's function table.
    Compiled(usize),
    /// A host function registered through the embedding API (spec.md §6.1).
    Host(Rc<dyn Fn(&mut crate::vm::Vm) -> Result<(), crate::error::PanicError>>),
    /// A bound method: the receiver plus the underlying unbound function.
    Bound(Box<Value>, Box<Value>),
}

impl Value {
    pub fn nil() -> Value {
        Value::default()
    }

    pub fn bool_(b: bool) -> Value {
        Value {
            tag: TYPE_BOOL,
            num: if b { 1.0 } else { 0.0 },
            obj: None,
        }
    }

    pub fn from_int(v: i32) -> Value {
        Value {
            tag: TYPE_INT32,
            num: v as f64,
            obj: None,
        }
    }

    pub fn untyped_int(v: i64) -> Value {
        Value {
            tag: UNTYPED_INT,
            num: v as f64,
            obj: None,
        }
    }

    pub fn float64(v: f64) -> Value {
        Value {
            tag: TYPE_FLOAT64,
            num: v,
            obj: None,
        }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value {
            tag: TYPE_STRING,
            num: 0.0,
            obj: Some(Rc::new(Obj::Str(s.into()))),
        }
    }

    /// Builds a slice value from already-typed elements, for host builtins
    /// that hand back Go-`[]T`-shaped results (`builtins.go`'s `NewSlice`).
    pub fn new_slice(value_type: Type, data: Vec<Value>) -> Value {
        Value {
            tag: slice_type(value_type),
            num: 0.0,
            obj: Some(Rc::new(Obj::Slice(RefCell::new(SliceObj { value_type, data })))),
        }
    }

    /// Clones out this slice's backing elements, or an empty vec if `self`
    /// isn't a slice.
    pub fn slice_values(&self) -> Vec<Value> {
        match self.obj.as_deref() {
            Some(Obj::Slice(s)) => s.borrow().data.clone(),
            _ => Vec::new(),
        }
    }

    pub fn as_int(&self) -> i32 {
        self.num as i32
    }

    pub fn as_f64(&self) -> f64 {
        self.num
    }

    pub fn as_bool(&self) -> bool {
        self.num != 0.0
    }

    pub fn as_str(&self) -> &str {
        match self.obj.as_deref() {
            Some(Obj::Str(s)) => s.as_str(),
            _ => "",
        }
    }

    pub fn is_nil(&self) -> bool {
        self.tag == TYPE_NIL
    }

    pub fn type_tag(&self) -> Type {
        base(self.tag)
    }

    /// Implicit coercion applied at a typed storage boundary (assignment to
    /// a variable/field/slot/slice element of a known static type).
    pub fn assign(self, t: Type) -> Value {
        if self.tag == t {
            return self;
        }
        if self.tag == UNTYPED_INT {
            return match t {
                TYPE_FLOAT64 => Value::float64(self.num),
                TYPE_INT32 => Value {
                    tag: t,
                    num: (self.num as i64 as i32) as f64,
                    obj: None,
                },
                TYPE_UINT32 => Value {
                    tag: t,
                    num: (self.num as i64 as u32) as f64,
                    obj: None,
                },
                TYPE_INT8 => Value {
                    tag: t,
                    num: (self.num as i64 as i8) as f64,
                    obj: None,
                },
                TYPE_UINT8 => Value {
                    tag: t,
                    num: (self.num as i64 as u8) as f64,
                    obj: None,
                },
                _ => Value::from_int(self.num as i32),
            };
        }
        if self.tag != TYPE_NIL {
            return self;
        }
        if t >= NILLABLE_MIN {
            return Value {
                tag: t,
                num: 0.0,
                obj: None,
            };
        }
        Value::nil()
    }

    /// Explicit conversion-expression semantics (`T(x)`), a full rewrap
    /// rather than assign's in-place reinterpretation.
    pub fn convert(&self, t: Type) -> Value {
        match t {
            TYPE_UINT8 => Value {
                tag: t,
                num: (self.num as i64 as u8) as f64,
                obj: None,
            },
            TYPE_INT8 => Value {
                tag: t,
                num: (self.num as i64 as i8) as f64,
                obj: None,
            },
            TYPE_INT32 => {
                if self.tag == TYPE_FLOAT64 {
                    Value {
                        tag: t,
                        num: (self.num as i32) as f64,
                        obj: None,
                    }
                } else {
                    Value {
                        tag: t,
                        num: (self.num as i64 as i32) as f64,
                        obj: None,
                    }
                }
            }
            TYPE_UINT32 => Value {
                tag: t,
                num: (self.num as i64 as u32) as f64,
                obj: None,
            },
            TYPE_FLOAT64 => Value::float64(self.num),
            TYPE_STRING => {
                if self.tag == TYPE_STRING {
                    self.clone()
                } else if self.tag & IS_NUMERIC_MASK != 0 {
                    let ch = char::from_u32(self.num as u32).unwrap_or('\u{FFFD}');
                    Value::string(ch.to_string())
                } else {
                    Value::string(String::new())
                }
            }
            _ => Value::nil(),
        }
    }

    pub fn equals(&self, b: &Value) -> bool {
        match self.tag {
            TYPE_BOOL => self.num == b.num,
            _ if self.tag & TYPE_FLOAT64 > 0 => self.num == b.num,
            TYPE_STRING => self.as_str() == b.as_str(),
            _ if base(self.tag) == TYPE_STRUCT || self.tag == TYPE_FUNC => {
                (b.tag == TYPE_NIL && self.obj.is_none())
                    || match (&self.obj, &b.obj) {
                        (Some(a), Some(bb)) => Rc::ptr_eq(a, bb),
                        (None, None) => true,
                        _ => false,
                    }
            }
            TYPE_NIL => b.tag == TYPE_NIL,
            _ if base(self.tag) == TYPE_SLICE && b.tag == TYPE_NIL => self.obj.is_none(),
            _ if base(self.tag) == TYPE_MAP && b.tag == TYPE_NIL => self.obj.is_none(),
            _ => false,
        }
    }
}

/// Binary arithmetic mixes two operand tags by OR-ing them: an untyped
/// constant combined with a typed value yields the typed tag, two untyped
/// constants stay untyped.
pub fn mix_type(a: Type, b: Type) -> Type {
    a | b
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            TYPE_NIL => write!(f, "nil"),
            TYPE_BOOL => write!(f, "{}", self.as_bool()),
            TYPE_INT32 | TYPE_UINT32 | TYPE_INT8 | TYPE_UINT8 | UNTYPED_INT => {
                write!(f, "{}", self.num as i64)
            }
            TYPE_FLOAT64 => write!(f, "{}", self.num),
            TYPE_STRING => write!(f, "{}", self.as_str()),
            _ => match self.obj.as_deref() {
                None => write!(f, "nil"),
                Some(Obj::Slice(s)) => {
                    let s = s.borrow();
                    let parts: Vec<String> = s.data.iter().map(|v| v.safe_str()).collect();
                    write!(f, "[{}]", parts.join(" "))
                }
                Some(Obj::StringMap(m)) => {
                    let m = m.borrow();
                    let mut parts: Vec<String> = m
                        .keys
                        .iter()
                        .filter_map(|k| {
                            m.data.get(k).map(|(key, v)| format!("{}:{}", key, v.safe_str()))
                        })
                        .collect();
                    parts.sort();
                    write!(f, "map[{}]", parts.join(" "))
                }
                Some(Obj::Struct(s)) => {
                    let s = s.borrow();
                    let mut items: Vec<String> = s
                        .lookup
                        .iter()
                        .filter_map(|(k, &idx)| {
                            s.fields.get(idx as i64).map(|v| format!("{}:{}", k, v.safe_str()))
                        })
                        .collect();
                    items.sort();
                    write!(f, "&{{{}}}", items.join(" "))
                }
                _ => write!(f, "<obj>"),
            },
        }
    }
}

impl Value {
    /// Cycle-safe `Display`: abbreviates any nested compound value so
    /// printing a self-referential struct/slice/map can't recurse forever
    /// (spec.md §9, "cyclic graphs").
    pub fn safe_str(&self) -> String {
        if !is_safe_str(self.tag) {
            return match base(self.tag) {
                TYPE_SLICE => "[...]".to_string(),
                TYPE_MAP => "map[...]".to_string(),
                TYPE_STRUCT => "&{...}".to_string(),
                _ => self.to_string(),
            };
        }
        self.to_string()
    }
}
