//! Query keys and their canonical string identity.
//!
//! A [`QueryKey`] is an ordered list of JSON-like parts. Two keys address the
//! same cache entry iff their canonical forms are equal. Canonicalization
//! re-emits every object's properties in lexicographic order, so objects built
//! with different insertion orders collapse onto one identity, while arrays
//! keep their positional order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered, heterogeneous key identifying one cached query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey {
    parts: Vec<Value>,
}

impl QueryKey {
    /// Create a key from already-converted parts.
    pub fn new(parts: Vec<Value>) -> Self {
        Self { parts }
    }

    /// Append a part, returning the extended key.
    ///
    /// Parts whose `Serialize` impl fails are stored as their debug string
    /// instead of failing the whole key.
    pub fn with_part<P>(mut self, part: P) -> Self
    where
        P: Serialize + fmt::Debug,
    {
        self.push(part);
        self
    }

    /// Append a part in place. See [`QueryKey::with_part`].
    pub fn push<P>(&mut self, part: P)
    where
        P: Serialize + fmt::Debug,
    {
        let value = serde_json::to_value(&part).unwrap_or_else(|_| Value::String(format!("{:?}", part)));
        self.parts.push(value);
    }

    /// The key's parts in positional order.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Canonical string identity of this key.
    pub fn canonical(&self) -> String {
        canonicalize(self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self::new(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self::new(vec![Value::from(part)])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self::new(vec![Value::from(part)])
    }
}

impl<P: Into<Value>, const N: usize> From<[P; N]> for QueryKey {
    fn from(parts: [P; N]) -> Self {
        Self::new(parts.into_iter().map(Into::into).collect())
    }
}

/// Serialize a key to its canonical string form.
///
/// Object properties are emitted in lexicographic order at every depth;
/// arrays and the top-level part list keep positional order.
pub fn canonicalize(key: &QueryKey) -> String {
    let mut out = String::with_capacity(16 * key.parts.len().max(1));
    out.push('[');
    for (i, part) in key.parts.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(part, &mut out);
    }
    out.push(']');
    out
}

/// Positional comparison of two keys' top-level parts.
///
/// Cheaper than comparing canonical strings; storage identity is still
/// decided by [`canonicalize`].
pub fn keys_equal(a: &QueryKey, b: &QueryKey) -> bool {
    a.parts.len() == b.parts.len() && a.parts.iter().zip(&b.parts).all(|(x, y)| x == y)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, nested)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(name.as_str()).to_string());
                out.push(':');
                write_canonical(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        primitive => out.push_str(&primitive.to_string()),
    }
}

/// Build a [`QueryKey`] from JSON-literal parts.
///
/// ```
/// use quarry_core::query_key;
///
/// let key = query_key!["todos", { "status": "done", "page": 2 }];
/// assert_eq!(key.canonical(), r#"["todos",{"page":2,"status":"done"}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::default()
    };
    ($($part:tt),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::__private::serde_json::json!($part)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_primitives() {
        let key = QueryKey::new(vec![json!("user"), json!(1), json!(true), json!(null)]);
        assert_eq!(canonicalize(&key), r#"["user",1,true,null]"#);
    }

    #[test]
    fn test_canonicalize_sorts_object_properties() {
        let a = QueryKey::new(vec![json!({"b": 1, "a": {"z": 0, "y": [3, 2]}})]);
        assert_eq!(canonicalize(&a), r#"[{"a":{"y":[3,2],"z":0},"b":1}]"#);
    }

    #[test]
    fn test_property_order_does_not_change_identity() {
        let mut first = serde_json::Map::new();
        first.insert("page".to_string(), json!(1));
        first.insert("filter".to_string(), json!("open"));

        let mut second = serde_json::Map::new();
        second.insert("filter".to_string(), json!("open"));
        second.insert("page".to_string(), json!(1));

        let a = QueryKey::from(["todos"]).with_part(Value::Object(first));
        let b = QueryKey::from(["todos"]).with_part(Value::Object(second));
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_array_order_changes_identity() {
        let a = query_key!["ids", [1, 2, 3]];
        let b = query_key!["ids", [3, 2, 1]];
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_canonicalize_escapes_strings() {
        let key = query_key!["quote\"d", { "we\"ird": "va\\lue" }];
        assert_eq!(key.canonical(), r#"["quote\"d",{"we\"ird":"va\\lue"}]"#);
    }

    #[test]
    fn test_keys_equal_is_positional() {
        let a = query_key!["user", 1];
        let b = query_key!["user", 1];
        let c = query_key![1, "user"];
        assert!(keys_equal(&a, &b));
        assert!(!keys_equal(&a, &c));
        assert!(!keys_equal(&a, &query_key!["user"]));
    }

    #[test]
    fn test_with_part_serializes_structs() {
        #[derive(Debug, Serialize)]
        struct Filter {
            status: &'static str,
            page: u32,
        }

        let key = QueryKey::from("todos").with_part(Filter {
            status: "open",
            page: 3,
        });
        assert_eq!(key.canonical(), r#"["todos",{"page":3,"status":"open"}]"#);
    }

    #[test]
    fn test_unserializable_part_falls_back_to_debug_string() {
        use std::collections::HashMap;

        // Maps with non-string keys cannot become JSON objects.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let key = QueryKey::from("odd").with_part(bad);
        assert_eq!(key.len(), 2);
        assert!(key.parts()[1].is_string());
    }

    fn arb_part() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".{0,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec((".{0,6}", inner), 0..4)
                    .prop_map(|entries| Value::Object(entries.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_canonical_form_is_json_of_the_parts(parts in prop::collection::vec(arb_part(), 0..4)) {
            let key = QueryKey::new(parts.clone());
            let parsed: Value = serde_json::from_str(&key.canonical()).unwrap();
            prop_assert_eq!(parsed, Value::Array(parts));
        }
    }

    #[test]
    fn test_empty_macro_and_display() {
        let key = query_key![];
        assert!(key.is_empty());
        assert_eq!(key.to_string(), "[]");
        assert_eq!(query_key!["a", 1].to_string(), r#"["a",1]"#);
    }
}
