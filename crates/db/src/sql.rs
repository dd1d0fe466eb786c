//! Helpers for queries whose table and column names are only known at runtime.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef, sqlite::SqliteRow};
use thiserror::Error;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("identifier pattern is valid")
});

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid sql identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Validate a table or column name and return it double-quoted.
pub fn ident(name: &str) -> Result<String, InvalidIdentifier> {
    if IDENTIFIER.is_match(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(InvalidIdentifier(name.to_string()))
    }
}

/// Bind a JSON value with the closest SQLite storage class. Arrays and
/// objects are stored as JSON text.
pub fn push_json_bind(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push_bind(Option::<String>::None);
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                builder.push_bind(i);
            } else {
                builder.push_bind(n.as_f64().unwrap_or_default());
            }
        }
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        Value::Array(_) | Value::Object(_) => {
            builder.push_bind(value.to_string());
        }
    }
}

/// Decode every column of a row into JSON. Columns listed in `json_columns`
/// are parsed back from JSON text.
pub fn row_to_attributes(
    row: &SqliteRow,
    json_columns: &[String],
) -> Result<Map<String, Value>, sqlx::Error> {
    let mut attributes = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let storage_class = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match storage_class.as_deref() {
            None => Value::Null,
            Some("INTEGER") => Value::from(row.try_get::<i64, _>(index)?),
            Some("REAL") => Number::from_f64(row.try_get::<f64, _>(index)?)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some("BLOB") => Value::String(
                String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index)?).into_owned(),
            ),
            Some(_) => {
                let text: String = row.try_get(index)?;
                if json_columns.iter().any(|c| c == column.name()) {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                } else {
                    Value::String(text)
                }
            }
        };
        attributes.insert(column.name().to_string(), value);
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_quotes_valid_names() {
        assert_eq!(ident("posts").unwrap(), "\"posts\"");
        assert_eq!(ident("order_column").unwrap(), "\"order_column\"");
    }

    #[test]
    fn ident_rejects_injection() {
        assert!(ident("posts; DROP TABLE users").is_err());
        assert!(ident("1posts").is_err());
        assert!(ident("").is_err());
        assert!(ident("a\"b").is_err());
    }
}
