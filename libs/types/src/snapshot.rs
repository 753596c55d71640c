//! Snapshot documents deposited by the upstream counter
//!
//! A snapshot describes the inventory count per category at one point in
//! time. Snapshots are immutable once constructed; the live view only reads
//! them. Category order is the order the backend reported, never sorted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SnapshotError;
use crate::ids::SnapshotId;

/// Ordering key of a snapshot.
///
/// Numeric keys order numerically and text keys lexicographically (ISO-8601
/// strings therefore sort chronologically). Every numeric key orders before
/// every text key, which keeps the order total across mixed producers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Numeric(n) => write!(f, "{}", n),
            Timestamp::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(n: i64) -> Self {
        Timestamp::Numeric(n)
    }
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Text(s.to_string())
    }
}

impl From<String> for Timestamp {
    fn from(s: String) -> Self {
        Timestamp::Text(s)
    }
}

/// Quantity reported for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub name: String,
    pub quantity: i64,
}

/// The `products` field of a snapshot document.
///
/// Malformed shapes are kept rather than rejected so that the snapshot can
/// still enter the history window with a zeroed aggregate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Products {
    /// Field missing or null.
    #[default]
    Absent,
    /// Category map in received order. May contain negative quantities.
    Counts(Vec<CategoryCount>),
    /// Anything that is not a map of integers, kept verbatim.
    Malformed(Value),
}

impl Products {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Products::Counts(
            pairs
                .into_iter()
                .map(|(name, quantity)| CategoryCount {
                    name: name.into(),
                    quantity,
                })
                .collect(),
        )
    }

    /// Reported entries, empty unless the field is a category map.
    pub fn entries(&self) -> &[CategoryCount] {
        match self {
            Products::Counts(entries) => entries,
            Products::Absent | Products::Malformed(_) => &[],
        }
    }

    /// False for non-map shapes and for maps carrying a negative quantity.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Products::Absent => true,
            Products::Counts(entries) => entries.iter().all(|c| c.quantity >= 0),
            Products::Malformed(_) => false,
        }
    }
}

impl From<Value> for Products {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Products::Absent,
            Value::Object(map) => {
                if map.values().all(|qty| qty.as_i64().is_some()) {
                    Products::Counts(
                        map.into_iter()
                            .map(|(name, qty)| CategoryCount {
                                name,
                                quantity: qty.as_i64().unwrap_or_default(),
                            })
                            .collect(),
                    )
                } else {
                    Products::Malformed(Value::Object(map))
                }
            }
            other => Products::Malformed(other),
        }
    }
}

impl From<Products> for Value {
    fn from(products: Products) -> Self {
        match products {
            Products::Absent => Value::Null,
            Products::Counts(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|c| (c.name, Value::from(c.quantity)))
                    .collect(),
            ),
            Products::Malformed(raw) => raw,
        }
    }
}

/// One backend-emitted count document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    id: SnapshotId,
    timestamp: Timestamp,
    #[serde(default)]
    products: Products,
}

impl Snapshot {
    pub fn new(id: impl Into<SnapshotId>, timestamp: impl Into<Timestamp>, products: Products) -> Self {
        Self {
            id: id.into(),
            timestamp: timestamp.into(),
            products,
        }
    }

    /// Build a snapshot from a document id and its raw data as stored by the
    /// backend (`{ "timestamp": ..., "products": {...} }`).
    pub fn from_document(id: impl Into<SnapshotId>, data: Value) -> Result<Self, SnapshotError> {
        let id = id.into();
        let mut fields = match data {
            Value::Object(fields) => fields,
            _ => return Err(SnapshotError::NotAnObject { id: id.to_string() }),
        };

        let timestamp = match fields.remove("timestamp") {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Timestamp::Numeric)
                .ok_or_else(|| SnapshotError::InvalidTimestamp { id: id.to_string() })?,
            Some(Value::String(s)) => Timestamp::Text(s),
            Some(_) => return Err(SnapshotError::InvalidTimestamp { id: id.to_string() }),
            None => return Err(SnapshotError::MissingTimestamp { id: id.to_string() }),
        };

        let products = fields
            .remove("products")
            .map(Products::from)
            .unwrap_or_default();

        Ok(Self {
            id,
            timestamp,
            products,
        })
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn products(&self) -> &Products {
        &self.products
    }

    pub fn is_well_formed(&self) -> bool {
        self.products.is_well_formed()
    }
}
