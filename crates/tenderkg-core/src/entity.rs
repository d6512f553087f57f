use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of node labels. New labels are added here and in the schema
/// document, never as free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Tender,
    Agency,
    Supplier,
    Category,
    Requirement,
    Keyword,
    Date,
}

impl EntityType {
    pub const ALL: [Self; 7] = [
        Self::Tender,
        Self::Agency,
        Self::Supplier,
        Self::Category,
        Self::Requirement,
        Self::Keyword,
        Self::Date,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tender => "Tender",
            Self::Agency => "Agency",
            Self::Supplier => "Supplier",
            Self::Category => "Category",
            Self::Requirement => "Requirement",
            Self::Keyword => "Keyword",
            Self::Date => "Date",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = crate::SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::SchemaError::UnknownEntityType(s.to_string()))
    }
}

/// The identity of an entity node: `(type, canonical_key)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub canonical_key: String,
}

impl EntityKey {
    #[must_use]
    pub fn new(entity_type: EntityType, canonical_key: impl Into<String>) -> Self {
        Self {
            entity_type,
            canonical_key: canonical_key.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.canonical_key)
    }
}

/// Attribute bag whose union is commutative, so merged state never depends
/// on the order sightings arrive in.
///
/// Arrays accumulate a sorted, de-duplicated union. Two differing scalars
/// resolve to the greater one (numbers numerically, strings lexically, so
/// ISO dates keep the latest). An array wins over a scalar under the same
/// key. Nulls never replace anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Map<String, Value>);

impl Attributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.union_one(key, value);
    }

    pub fn push(&mut self, key: impl Into<String>, item: impl Into<String>) {
        self.union_one(key.into(), Value::Array(vec![Value::String(item.into())]));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges `other` into `self`. Returns whether anything changed.
    pub fn union(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (key, value) in &other.0 {
            changed |= self.union_one(key.clone(), value.clone());
        }
        changed
    }

    fn union_one(&mut self, key: String, value: Value) -> bool {
        if value.is_null() {
            return false;
        }
        match self.0.get_mut(&key) {
            Some(Value::Array(existing)) => {
                let Value::Array(incoming) = value else {
                    return false;
                };
                let before = existing.len();
                existing.extend(incoming);
                sort_unique(existing);
                existing.len() != before
            }
            Some(existing) if !existing.is_null() => match value {
                Value::Array(mut items) => {
                    sort_unique(&mut items);
                    *existing = Value::Array(items);
                    true
                }
                incoming if scalar_cmp(&incoming, existing) == Ordering::Greater => {
                    *existing = incoming;
                    true
                }
                _ => false,
            },
            _ => {
                let value = match value {
                    Value::Array(mut items) => {
                        sort_unique(&mut items);
                        Value::Array(items)
                    }
                    other => other,
                };
                self.0.insert(key, value);
                true
            }
        }
    }
}

/// Total order over non-array JSON values: by kind, then by value.
fn scalar_cmp(a: &Value, b: &Value) -> Ordering {
    const fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (fx, fy) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            fx.total_cmp(&fy).then_with(|| x.to_string().cmp(&y.to_string()))
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    })
}

fn sort_unique(items: &mut Vec<Value>) {
    items.sort_by_key(ToString::to_string);
    items.dedup();
}

/// An entity as produced by extraction, before it reaches the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub display_name: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl Entity {
    #[must_use]
    pub fn new(key: EntityKey, display_name: String, confidence: f64) -> Self {
        Self {
            key,
            display_name,
            confidence: clamp_confidence(confidence),
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.union(&attributes);
        self
    }

    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        self.key.entity_type
    }

    /// Folds another sighting of the same key into this one. The result is
    /// the same whichever sighting comes first.
    pub fn absorb(&mut self, other: &Self) {
        debug_assert_eq!(self.key, other.key);
        self.confidence = self.confidence.max(other.confidence);
        if other.display_name < self.display_name {
            self.display_name.clone_from(&other.display_name);
        }
        self.attributes.union(&other.attributes);
    }
}

/// Clamps into `[0, 1]`. Non-finite input becomes 0 so it can never pass a
/// threshold or reach a `NOT NULL` column.
#[must_use]
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_type_roundtrip_names() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("Person".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_union_resolves_scalars_to_greatest() {
        let mut attrs = Attributes::new();
        attrs.insert("award_date", json!("2024-01-02"));
        let mut later = Attributes::new();
        later.insert("award_date", json!("2025-05-05"));
        later.insert("status", json!("Awarded"));

        assert!(attrs.union(&later));
        assert_eq!(attrs.get_str("award_date"), Some("2025-05-05"));
        assert_eq!(attrs.get_str("status"), Some("Awarded"));

        let mut older = Attributes::new();
        older.insert("award_date", json!("2023-12-31"));
        assert!(!attrs.union(&older));
        assert_eq!(attrs.get_str("award_date"), Some("2025-05-05"));
    }

    #[test]
    fn test_union_is_commutative() {
        let sightings = [
            json!({"award_date": "2021-01-10", "awarded_amt": 120_000.5, "surface_forms": ["ACME"]}),
            json!({"award_date": "2023-06-01", "awarded_amt": 99.0, "surface_forms": ["Acme"]}),
            json!({"awarded_amt": 100_000, "status": "Awarded", "surface_forms": "acme"}),
        ];
        let bags: Vec<Attributes> = sightings
            .iter()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .collect();

        let fold = |order: &[usize]| {
            let mut acc = Attributes::new();
            for &i in order {
                acc.union(&bags[i]);
            }
            acc
        };
        let first = fold(&[0, 1, 2]);
        for order in [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            assert_eq!(fold(&order), first, "order {order:?}");
        }
        assert_eq!(first.get_str("award_date"), Some("2023-06-01"));
        assert_eq!(first.get("awarded_amt"), Some(&json!(120_000.5)));
        assert_eq!(first.get("surface_forms"), Some(&json!(["ACME", "Acme"])));
    }

    #[test]
    fn test_union_ignores_null() {
        let mut attrs = Attributes::new();
        attrs.insert("amount", json!(100.0));
        let mut later = Attributes::new();
        later.0.insert("amount".into(), Value::Null);

        assert!(!attrs.union(&later));
        assert_eq!(attrs.get("amount"), Some(&json!(100.0)));
    }

    #[test]
    fn test_union_fills_null_slot() {
        let mut attrs = Attributes::new();
        attrs.0.insert("amount".into(), Value::Null);
        let mut later = Attributes::new();
        later.insert("amount", json!(5.0));

        assert!(attrs.union(&later));
        assert_eq!(attrs.get("amount"), Some(&json!(5.0)));
    }

    #[test]
    fn test_array_union_is_order_independent() {
        let mut a = Attributes::new();
        a.push("surface_forms", "MOH");
        a.push("surface_forms", "Ministry of Health");

        let mut b = Attributes::new();
        b.push("surface_forms", "Ministry of Health");
        b.push("surface_forms", "MOH");

        assert_eq!(a, b);
        assert!(!a.union(&b));
    }

    #[test]
    fn test_absorb_keeps_max_confidence() {
        let key = EntityKey::new(EntityType::Keyword, "cloud");
        let mut first = Entity::new(key.clone(), "cloud".into(), 0.6);
        let second = Entity::new(key, "Cloud".into(), 0.9);
        first.absorb(&second);
        assert!((first.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(first.display_name, "Cloud");
    }

    #[test]
    fn test_non_finite_confidence_clamps_to_zero() {
        let key = EntityKey::new(EntityType::Keyword, "noise");
        assert!(Entity::new(key.clone(), "noise".into(), f64::NAN).confidence.abs() < f64::EPSILON);
        assert!(Entity::new(key, "noise".into(), f64::INFINITY).confidence.abs() < f64::EPSILON);
        assert!((clamp_confidence(1.7) - 1.0).abs() < f64::EPSILON);
    }
}
