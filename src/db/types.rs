//! Row decoding.
//!
//! Rows come back as JSON maps so the physical connection trait does not leak
//! sqlx types. Each column is decoded by trying a short list of Rust types in
//! order; the first one the driver accepts wins. Values no candidate can
//! decode become `null`.

use crate::models::Row;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _};

pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

/// Try each candidate type in turn; `Option` makes NULL decode successfully.
macro_rules! decode_column {
    ($row:expr, $idx:expr) => {{
        if let Ok(v) = $row.try_get::<Option<i64>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<i32>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<f64>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<bool>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<String>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<chrono::NaiveDateTime>, _>($idx) {
            v.map(|t| JsonValue::from(t.to_string()))
                .unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>($idx) {
            v.map(|t| JsonValue::from(t.to_rfc3339()))
                .unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        }
    }};
}

macro_rules! impl_row_to_json {
    ($row:ty) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Row {
                self.columns()
                    .iter()
                    .map(|col| {
                        let idx = col.ordinal();
                        (col.name().to_string(), decode_column!(self, idx))
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow);
impl_row_to_json!(PgRow);
impl_row_to_json!(SqliteRow);
