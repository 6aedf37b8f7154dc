//! Structural JSON diff in the "compact" syntax.
//!
//! * objects: changed or added keys map to their new value (or a nested diff
//!   when both sides are containers of the same kind); removed keys are listed
//!   under `$delete`.
//! * arrays: elements are aligned by longest common subsequence. `$delete`
//!   lists indices into the old array, `$insert` lists `[index, value]` pairs
//!   into the new one, both ascending.
//! * anything else: `{"$replace": new}`.
//!
//! Equal inputs produce `{}` and nothing else does.

use serde_json::{json, Map, Value};

pub const DELETE: &str = "$delete";
pub const INSERT: &str = "$insert";
pub const REPLACE: &str = "$replace";

/// Difference from `old` to `new`.
pub fn diff(old: &Value, new: &Value) -> Value {
    match changes(old, new) {
        None => Value::Object(Map::new()),
        Some(Change::Nested(d)) => d,
        Some(Change::Value(v)) => {
            let mut out = Map::new();
            out.insert(REPLACE.to_string(), v);
            Value::Object(out)
        }
    }
}

/// True when `d` is the empty diff.
pub fn is_empty(d: &Value) -> bool {
    d.as_object().is_some_and(Map::is_empty)
}

enum Change {
    Nested(Value),
    Value(Value),
}

fn changes(old: &Value, new: &Value) -> Option<Change> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => Some(Change::Nested(diff_objects(a, b))),
        (Value::Array(a), Value::Array(b)) => Some(Change::Nested(diff_arrays(a, b))),
        _ => Some(Change::Value(new.clone())),
    }
}

fn diff_objects(old: &Map<String, Value>, new: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for (key, value) in new {
        match old.get(key) {
            None => {
                out.insert(key.clone(), value.clone());
            }
            Some(previous) => match changes(previous, value) {
                None => {}
                Some(Change::Nested(d)) | Some(Change::Value(d)) => {
                    out.insert(key.clone(), d);
                }
            },
        }
    }

    let removed: Vec<Value> = old
        .keys()
        .filter(|k| !new.contains_key(*k))
        .map(|k| Value::String(k.clone()))
        .collect();
    if !removed.is_empty() {
        out.insert(DELETE.to_string(), Value::Array(removed));
    }
    Value::Object(out)
}

fn diff_arrays(old: &[Value], new: &[Value]) -> Value {
    let keep = lcs(old, new);

    let mut deleted = Vec::new();
    let mut inserted = Vec::new();
    let (mut i, mut j) = (0, 0);
    for &(ki, kj) in keep.iter().chain(std::iter::once(&(old.len(), new.len()))) {
        deleted.extend((i..ki).map(|idx| json!(idx)));
        inserted.extend((j..kj).map(|idx| Value::Array(vec![json!(idx), new[idx].clone()])));
        i = ki + 1;
        j = kj + 1;
    }

    let mut out = Map::new();
    if !deleted.is_empty() {
        out.insert(DELETE.to_string(), Value::Array(deleted));
    }
    if !inserted.is_empty() {
        out.insert(INSERT.to_string(), Value::Array(inserted));
    }
    Value::Object(out)
}

/// Index pairs of a longest common subsequence, ascending in both arrays.
fn lcs(a: &[Value], b: &[Value]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    // table[i][j] = LCS length of a[i..] and b[j..]
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut pairs = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}
