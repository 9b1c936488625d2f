//! Row transforms applied to a chain's final projection.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Row predicate used by [`Transform::Filter`].
pub type RowPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Row mapping used by [`Transform::Map`].
pub type RowMapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// One projection transform.
#[derive(Clone)]
pub enum Transform {
    /// Keep the first `n` rows.
    Head(usize),
    Filter(RowPredicate),
    /// Keep only the named fields of object rows, in the given order.
    /// Non-object rows pass through unchanged.
    SelectColumns(Vec<String>),
    /// Stable sort by a field of object rows (or the row itself for scalar
    /// rows). Numbers and numeric strings compare numerically and come
    /// before text; rows missing the key always sort last.
    Sort { key: String, descending: bool },
    Map(RowMapper),
}

impl Transform {
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        match self {
            Self::Head(n) => rows.into_iter().take(*n).collect(),
            Self::Filter(pred) => rows.into_iter().filter(|row| pred(row)).collect(),
            Self::SelectColumns(columns) => rows
                .into_iter()
                .map(|row| select_columns(row, columns))
                .collect(),
            Self::Sort { key, descending } => sort_rows(rows, key, *descending),
            Self::Map(f) => rows.into_iter().map(|row| f(row)).collect(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Head(n) => format!("head({n})"),
            Self::Filter(_) => "filter".to_string(),
            Self::SelectColumns(columns) => format!("select({})", columns.join(",")),
            Self::Sort {
                key,
                descending: false,
            } => format!("sort({key})"),
            Self::Sort {
                key,
                descending: true,
            } => format!("sort_desc({key})"),
            Self::Map(_) => "map".to_string(),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn select_columns(row: Value, columns: &[String]) -> Value {
    let Value::Object(mut fields) = row else {
        return row;
    };
    let mut selected = Map::new();
    for column in columns {
        if let Some(value) = fields.remove(column) {
            selected.insert(column.clone(), value);
        }
    }
    Value::Object(selected)
}

fn sort_rows(mut rows: Vec<Value>, key: &str, descending: bool) -> Vec<Value> {
    rows.sort_by(|a, b| match (sort_key(a, key), sort_key(b, key)) {
        (Some(a), Some(b)) => {
            let ord = a.cmp(&b);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    rows
}

/// Totally ordered sort key: numbers, then text, then any other JSON.
#[derive(Debug)]
enum SortKey<'a> {
    Number(f64),
    Text(&'a str),
    Other(String),
}

impl SortKey<'_> {
    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Text(_) => 1,
            Self::Other(_) => 2,
        }
    }
}

impl Ord for SortKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Other(a), Self::Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey<'_> {}

fn sort_key<'a>(row: &'a Value, key: &str) -> Option<SortKey<'a>> {
    let value = match row {
        Value::Object(fields) => fields.get(key).filter(|v| !v.is_null())?,
        Value::Null => return None,
        other => other,
    };
    Some(match value {
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| SortKey::Other(n.to_string()), SortKey::Number),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => SortKey::Number(n),
            _ => SortKey::Text(s),
        },
        other => SortKey::Other(other.to_string()),
    })
}
