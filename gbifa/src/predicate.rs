//! Boolean filter predicate trees
//!
//! Every occurrence download carries the filter expression that selected its
//! records: a tree of `equals`/`in` leaves under boolean combinators. The
//! pipeline only ever asks one question of these trees — "which values are
//! bound to filter key X?" — so the model is deliberately narrow. Shapes it
//! does not recognize parse to [`Predicate::Unsupported`] and contribute no
//! values; a strange subtree must never sink the record it belongs to.

use serde_json::Value;

/// A parsed filter predicate node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `{type: "equals", key, value}` — one value bound to one filter key
    Equals { key: String, value: String },
    /// `{type: "in", key, values}` — several values bound to one filter key
    In { key: String, values: Vec<String> },
    /// Any node owning a `predicates` array (and, or, ...)
    Combinator { predicates: Vec<Predicate> },
    /// Unrecognized or malformed node; inert
    Unsupported,
}

impl Predicate {
    /// Parse a raw predicate value into a typed tree
    ///
    /// Never fails: anything that is not a recognizable node becomes
    /// [`Predicate::Unsupported`].
    pub fn parse(raw: &Value) -> Self {
        let Some(node) = raw.as_object() else {
            return Self::Unsupported;
        };

        // Combinators are identified by their child list rather than the
        // type tag, so "and"/"or" and any future list-shaped operator all
        // traverse the same way
        if let Some(children) = node.get("predicates").and_then(Value::as_array) {
            return Self::Combinator {
                predicates: children.iter().map(Self::parse).collect(),
            };
        }

        let key = node.get("key").and_then(Value::as_str);
        match (node.get("type").and_then(Value::as_str), key) {
            (Some("equals"), Some(key)) => match node.get("value").and_then(scalar_string) {
                Some(value) => Self::Equals {
                    key: key.to_string(),
                    value,
                },
                None => Self::Unsupported,
            },
            (Some("in"), Some(key)) => match node.get("values").and_then(Value::as_array) {
                Some(values) => Self::In {
                    key: key.to_string(),
                    values: values.iter().filter_map(scalar_string).collect(),
                },
                None => Self::Unsupported,
            },
            _ => Self::Unsupported,
        }
    }

    /// Collect every value bound to `target` anywhere in the tree
    ///
    /// Pre-order, depth-first; child order preserved; duplicates preserved.
    /// Deduplication is the caller's concern.
    pub fn values_for(&self, target: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_values(target, &mut out);
        out
    }

    fn collect_values(&self, target: &str, out: &mut Vec<String>) {
        match self {
            Self::Equals { key, value } if key == target => out.push(value.clone()),
            Self::In { key, values } if key == target => out.extend(values.iter().cloned()),
            Self::Combinator { predicates } => {
                for child in predicates {
                    child.collect_values(target, out);
                }
            }
            _ => {}
        }
    }
}

/// Stringify a scalar JSON value so numeric keys and their string forms
/// collate together
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
