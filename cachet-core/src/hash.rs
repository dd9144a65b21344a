//! Stable hashing and deep equality for parameter values.
//!
//! [`stable_hash`] renders a [`Value`] into a deterministic canonical string:
//! record keys are sorted, array order is kept, dates collapse to their epoch
//! milliseconds and a back-reference to a shared cell that is already being
//! rendered becomes [`CIRCULAR_SENTINEL`]. Two records with the same entries
//! hash identically regardless of insertion order, which is what lets
//! observers memoize on parameters and compare query identities.
//!
//! [`identity_hash`] is the same walk with the key normalizer's primitive
//! coercion applied to leaves, so `{id: 5}` and `{id: "5"}` collapse to one
//! identity. Query identity is always computed with it.

use sha2::{Digest, Sha256};

use crate::key::push_quoted;
use crate::value::{Record, Value};

/// Rendered in place of a back-reference to an enclosing shared cell.
pub const CIRCULAR_SENTINEL: &str = "[Circular]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaves {
    /// Strings quoted, numbers and booleans bare.
    Typed,
    /// Every primitive rendered as a quoted canonical string.
    Coerced,
}

/// Canonical string for `value`.
///
/// - null → `null`, undefined → `undefined`
/// - strings are quoted, numbers and booleans are bare
/// - dates → `Date(<epoch millis>)`
/// - arrays keep element order, records sort keys
pub fn stable_hash(value: &Value) -> String {
    Canonicalizer::new(Leaves::Typed).render(value)
}

/// Canonical string with primitive leaves coerced to their text form.
pub fn identity_hash(value: &Value) -> String {
    Canonicalizer::new(Leaves::Coerced).render(value)
}

/// Hex SHA-256 of [`stable_hash`].
pub fn stable_digest(value: &Value) -> String {
    digest(&stable_hash(value))
}

/// Hex SHA-256 of [`identity_hash`].
pub fn identity_digest(value: &Value) -> String {
    digest(&identity_hash(value))
}

/// Hex SHA-256 of an already canonical string.
pub fn digest(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

struct Canonicalizer {
    leaves: Leaves,
    /// Shared cells currently being rendered.
    path: Vec<usize>,
    out: String,
}

impl Canonicalizer {
    fn new(leaves: Leaves) -> Self {
        Self {
            leaves,
            path: Vec::new(),
            out: String::with_capacity(64),
        }
    }

    fn render(mut self, value: &Value) -> String {
        self.write(value);
        self.out
    }

    fn write(&mut self, value: &Value) {
        match value {
            Value::Undefined => self.out.push_str("undefined"),
            Value::Null => self.out.push_str("null"),
            Value::Bool(b) => self.leaf(if *b { "true" } else { "false" }),
            Value::Int(i) => self.leaf(&i.to_string()),
            Value::Float(x) => self.leaf(&format_float(*x)),
            Value::Str(s) => push_quoted(&mut self.out, s),
            Value::Date(d) => {
                self.out.push_str("Date(");
                self.out.push_str(&d.timestamp_millis().to_string());
                self.out.push(')');
            }
            Value::Array(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.write(item);
                }
                self.out.push(']');
            }
            Value::Record(record) => {
                let mut entries: Vec<(&str, &Value)> = record.iter().collect();
                entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
                self.out.push('{');
                for (i, (key, item)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    push_quoted(&mut self.out, key);
                    self.out.push(':');
                    self.write(item);
                }
                self.out.push('}');
            }
            Value::Shared(cell) => {
                let id = cell.id();
                if self.path.contains(&id) {
                    self.out.push_str(CIRCULAR_SENTINEL);
                } else {
                    self.path.push(id);
                    let inner = cell.get();
                    self.write(&inner);
                    self.path.pop();
                }
            }
        }
    }

    fn leaf(&mut self, text: &str) {
        match self.leaves {
            Leaves::Typed => self.out.push_str(text),
            Leaves::Coerced => push_quoted(&mut self.out, text),
        }
    }
}

/// Shortest round-trip form; `-0` renders as `0`.
fn format_float(x: f64) -> String {
    if x == 0.0 {
        "0".to_string()
    } else {
        x.to_string()
    }
}

// ============================================================================
// DEEP EQUALITY
// ============================================================================

/// Structural equality with the same semantics as [`stable_hash`].
///
/// Records compare order-insensitively, arrays order-sensitively, dates by
/// epoch milliseconds, and integers equal floats of the same numeric value.
/// Back-references are equal when both sides point back to the same depth.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    Equality::default().eq(a, b)
}

pub(crate) fn records_equal(a: &Record, b: &Record) -> bool {
    Equality::default().records(a, b)
}

#[derive(Default)]
struct Equality {
    /// (cell id, depth entered) for shared cells open on the left side.
    left: Vec<(usize, usize)>,
    right: Vec<(usize, usize)>,
    depth: usize,
}

impl Equality {
    fn eq(&mut self, a: &Value, b: &Value) -> bool {
        let a_back = back_reference(&self.left, a);
        let b_back = back_reference(&self.right, b);
        if a_back.is_some() || b_back.is_some() {
            return a_back == b_back;
        }

        match (a, b) {
            (Value::Shared(ca), Value::Shared(cb)) if ca.ptr_eq(cb) => true,
            (Value::Shared(cell), _) => {
                self.left.push((cell.id(), self.depth));
                let inner = cell.get();
                let equal = self.eq(&inner, b);
                self.left.pop();
                equal
            }
            (_, Value::Shared(cell)) => {
                self.right.push((cell.id(), self.depth));
                let inner = cell.get();
                let equal = self.eq(a, &inner);
                self.right.pop();
                equal
            }
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Float(x), Value::Float(y)) => floats_equal(*x, *y),
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                floats_equal(*i as f64, *f)
            }
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Date(x), Value::Date(y)) => x.timestamp_millis() == y.timestamp_millis(),
            (Value::Array(xs), Value::Array(ys)) => {
                if xs.len() != ys.len() {
                    return false;
                }
                self.depth += 1;
                let equal = xs.iter().zip(ys).all(|(x, y)| self.eq(x, y));
                self.depth -= 1;
                equal
            }
            (Value::Record(x), Value::Record(y)) => self.records(x, y),
            _ => false,
        }
    }

    fn records(&mut self, a: &Record, b: &Record) -> bool {
        if a.len() != b.len() {
            return false;
        }
        self.depth += 1;
        let equal = a.iter().all(|(key, x)| match b.get(key) {
            Some(y) => self.eq(x, y),
            None => false,
        });
        self.depth -= 1;
        equal
    }
}

fn back_reference(open: &[(usize, usize)], value: &Value) -> Option<usize> {
    match value {
        Value::Shared(cell) => {
            let id = cell.id();
            open.iter().find(|(open_id, _)| *open_id == id).map(|(_, depth)| *depth)
        }
        _ => None,
    }
}

fn floats_equal(x: f64, y: f64) -> bool {
    x == y || (x.is_nan() && y.is_nan())
}
