//! Typed columnar frames built from loosely typed rows.
//!
//! Rows coming back from the database carry dynamically typed values. The
//! [`ColumnBuilder`] fixes every column's type from the first non-null value
//! seen for it and coerces later values toward that type through a
//! [`CoercionTable`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FRAME_NAME: &str = "response";
pub const FRAME_TYPE_TIMESERIES_WIDE: &str = "timeseries-wide";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int64,
    Float64,
    String,
    Time,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int64 => "int64",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Time(DateTime<Utc>),
}

impl ScalarValue {
    /// Type carried by the value; `None` for null.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Bool(_) => Some(FieldType::Bool),
            ScalarValue::Int64(_) => Some(FieldType::Int64),
            ScalarValue::Float64(_) => Some(FieldType::Float64),
            ScalarValue::String(_) => Some(FieldType::String),
            ScalarValue::Time(_) => Some(FieldType::Time),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int64(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Float64(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::String(value)
    }
}

impl From<DateTime<Utc>> for ScalarValue {
    fn from(value: DateTime<Utc>) -> Self {
        ScalarValue::Time(value)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ScalarValue::Null)
    }
}

/// One result row as named values, in the order the columns were declared.
///
/// Names are kept verbatim, so a query selecting two columns with the same
/// name yields both entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: Vec<(String, ScalarValue)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<ScalarValue>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N: Into<String>, V: Into<ScalarValue>> FromIterator<(N, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub values: Vec<ScalarValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub executed_query_string: String,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub name: String,
    pub fields: Vec<Column>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<FrameMeta>,
}

impl Frame {
    /// A frame with a name only: no columns and no metadata.
    pub fn empty() -> Self {
        Self {
            name: FRAME_NAME.to_string(),
            fields: Vec::new(),
            meta: None,
        }
    }

    pub fn rows(&self) -> usize {
        self.fields.first().map_or(0, |column| column.values.len())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.fields.iter().find(|column| column.name == name)
    }
}

/// Converts a value toward a column type. `Err` hands the value back
/// untouched when it cannot be converted.
pub type CoercionFn = fn(ScalarValue) -> std::result::Result<ScalarValue, ScalarValue>;

fn text_to_float(value: ScalarValue) -> std::result::Result<ScalarValue, ScalarValue> {
    match value {
        ScalarValue::String(text) => match text.trim().parse::<f64>() {
            Ok(parsed) => Ok(ScalarValue::Float64(parsed)),
            Err(_) => Err(ScalarValue::String(text)),
        },
        other => Err(other),
    }
}

/// Coercions keyed by (observed type, column type).
#[derive(Debug, Clone)]
pub struct CoercionTable {
    rules: HashMap<(FieldType, FieldType), CoercionFn>,
}

impl CoercionTable {
    /// A table with no rules at all.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, from: FieldType, to: FieldType, rule: CoercionFn) -> Self {
        self.rules.insert((from, to), rule);
        self
    }

    /// Coerce `value` into `target`. Nulls, values already of the target
    /// type, and values with no applicable rule pass through unchanged; a
    /// failed conversion keeps the original value.
    pub fn coerce(&self, target: FieldType, value: ScalarValue) -> ScalarValue {
        let source = match value.field_type() {
            Some(source) if source != target => source,
            _ => return value,
        };

        match self.rules.get(&(source, target)) {
            Some(rule) => rule(value).unwrap_or_else(|original| original),
            None => value,
        }
    }
}

impl Default for CoercionTable {
    fn default() -> Self {
        Self::empty().with_rule(FieldType::String, FieldType::Float64, text_to_float)
    }
}

struct Slot {
    name: String,
    field_type: Option<FieldType>,
}

/// Builds frames from row sets.
#[derive(Debug, Clone, Default)]
pub struct ColumnBuilder {
    coercions: CoercionTable,
}

impl ColumnBuilder {
    pub fn new(coercions: CoercionTable) -> Self {
        Self { coercions }
    }

    pub fn build(&self, rows: &[RawRow], query_text: &str, ref_id: &str) -> Frame {
        if rows.is_empty() {
            return Frame::empty();
        }

        // Columns are keyed by (name, occurrence within the row) so repeated
        // names stay separate columns. Output names are unique.
        let mut slots: Vec<Slot> = Vec::new();
        let mut index: HashMap<(&str, usize), usize> = HashMap::new();
        let mut taken: HashSet<String> = HashSet::new();

        for row in rows {
            let mut seen: HashMap<&str, usize> = HashMap::new();
            for (name, value) in row.iter() {
                let occurrence = next_occurrence(&mut seen, name);
                let slot = *index.entry((name, occurrence)).or_insert_with(|| {
                    slots.push(Slot {
                        name: column_name(&mut taken, name, occurrence),
                        field_type: None,
                    });
                    slots.len() - 1
                });
                if slots[slot].field_type.is_none() {
                    slots[slot].field_type = value.field_type();
                }
            }
        }

        let mut fields: Vec<Column> = slots
            .into_iter()
            .map(|slot| Column {
                name: slot.name,
                // Columns holding nothing but nulls have no observed type.
                field_type: slot.field_type.unwrap_or(FieldType::String),
                values: Vec::with_capacity(rows.len()),
            })
            .collect();

        for row in rows {
            let mut filled = vec![false; fields.len()];
            let mut seen: HashMap<&str, usize> = HashMap::new();
            for (name, value) in row.iter() {
                let occurrence = next_occurrence(&mut seen, name);
                let slot = index[&(name, occurrence)];
                let column = &mut fields[slot];
                column
                    .values
                    .push(self.coercions.coerce(column.field_type, value.clone()));
                filled[slot] = true;
            }
            for (slot, done) in filled.into_iter().enumerate() {
                if !done {
                    fields[slot].values.push(ScalarValue::Null);
                }
            }
        }

        Frame {
            name: FRAME_NAME.to_string(),
            fields,
            meta: Some(FrameMeta {
                executed_query_string: query_text.to_string(),
                frame_type: FRAME_TYPE_TIMESERIES_WIDE.to_string(),
                request_id: ref_id.to_string(),
            }),
        }
    }
}

fn next_occurrence<'a>(seen: &mut HashMap<&'a str, usize>, name: &'a str) -> usize {
    let counter = seen.entry(name).or_insert(0);
    let occurrence = *counter;
    *counter += 1;
    occurrence
}

/// `name` for the first occurrence and `name_N` for later ones, bumping `N`
/// past any name already handed out.
fn column_name(taken: &mut HashSet<String>, name: &str, occurrence: usize) -> String {
    let mut suffix = occurrence + 1;
    let mut candidate = if occurrence == 0 {
        name.to_string()
    } else {
        format!("{}_{}", name, suffix)
    };
    while taken.contains(&candidate) {
        suffix += 1;
        candidate = format!("{}_{}", name, suffix);
    }
    taken.insert(candidate.clone());
    candidate
}
