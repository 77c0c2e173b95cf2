//! Product attributes and change tracking

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scalar product attributes extracted from a product page
///
/// `None` means the field was not observed, never that it was cleared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductData {
    pub title: Option<String>,
    pub price: Option<String>,
    pub category: Option<String>,
    pub is_prime: Option<bool>,
    pub brand: Option<String>,
    pub rank: Option<u32>,
    pub availability_quantity: Option<u32>,
    pub availability_status: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub date_first_available: Option<String>,
    pub discount_coupon: Option<String>,
    pub rating_stars: Option<String>,
    pub purchase_info: Option<String>,
    pub proxy_country: Option<String>,
}

/// One field whose value differs from the previously known state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Fields that never appear in a change log
const UNTRACKED_FIELDS: &[&str] = &["proxy_country"];

impl ProductData {
    /// Merges a newer observation into `self` and returns what changed
    ///
    /// Fields absent from `newer` keep their stored value. Changes are
    /// reported sorted by field name.
    pub fn apply(&mut self, newer: &ProductData) -> Result<Vec<FieldChange>, serde_json::Error> {
        let mut current = to_map(self)?;
        let incoming = to_map(newer)?;
        let mut changes = Vec::new();

        for (field, new_value) in incoming {
            if new_value.is_null() {
                continue;
            }
            let old_value = current.get(&field).cloned().unwrap_or(Value::Null);
            if old_value == new_value {
                continue;
            }
            if !UNTRACKED_FIELDS.contains(&field.as_str()) {
                changes.push(FieldChange {
                    field: field.clone(),
                    old_value,
                    new_value: new_value.clone(),
                });
            }
            current.insert(field, new_value);
        }

        *self = serde_json::from_value(Value::Object(current))?;
        Ok(changes)
    }
}

fn to_map(data: &ProductData) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
