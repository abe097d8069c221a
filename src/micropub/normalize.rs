//! Normalizes Micropub request bodies into a microformats2-shaped object.
//!
//! Form posts, multipart posts and JSON posts all end up as the same
//! `Mf2Entry` so the rest of the pipeline never cares how the request was
//! encoded. This module only reshapes syntax; it attaches no meaning to any
//! property.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    FormUrlEncoded,
    MultipartForm,
}

impl ContentType {
    /// Parse a Content-Type header value, ignoring parameters such as
    /// `; charset=utf-8` and `; boundary=...`.
    pub fn parse(header: &str) -> AppResult<Self> {
        let base = header.split(';').next().unwrap_or("").trim();
        match base {
            "application/json" => Ok(ContentType::Json),
            "application/x-www-form-urlencoded" => Ok(ContentType::FormUrlEncoded),
            "multipart/form-data" => Ok(ContentType::MultipartForm),
            _ => Err(AppError::UnknownContentType),
        }
    }
}

/// An h-entry shaped property bag: `{type, properties: {key: [values]}}`.
/// Property keys always use underscores, values are always lists.
#[derive(Debug, Clone, PartialEq)]
pub struct Mf2Entry {
    pub h_type: String,
    pub properties: HashMap<String, Vec<Value>>,
}

impl Mf2Entry {
    pub fn has(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn first(&self, key: &str) -> Option<&Value> {
        self.properties.get(key).and_then(|v| v.first())
    }

    /// First value of a property, as a string, if it is one.
    pub fn first_str(&self, key: &str) -> Option<&str> {
        self.first(key).and_then(|v| v.as_str())
    }

    /// All string values of a property.
    pub fn strs(&self, key: &str) -> Vec<&str> {
        self.properties
            .get(key)
            .map(|vals| vals.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Convert form/multipart text fields into an `Mf2Entry`.
///
/// Keys ending in `[]` are repeated-value keys and merge with their bare
/// form. The `access_token` field belongs to the auth layer and is excluded.
pub fn normalize_form(pairs: &[(String, String)]) -> Mf2Entry {
    let mut properties: HashMap<String, Vec<Value>> = HashMap::new();
    let mut h = String::new();

    for (key, value) in pairs {
        let key = key.strip_suffix("[]").unwrap_or(key);
        if key == "access_token" {
            continue;
        }
        if key == "h" {
            h = value.clone();
        }
        properties
            .entry(underscore(key))
            .or_default()
            .push(Value::String(value.clone()));
    }

    Mf2Entry {
        h_type: format!("h-{}", h),
        properties,
    }
}

/// Convert a JSON Micropub body (`{"type": ["h-entry"], "properties": ...}`)
/// into an `Mf2Entry`. The one-element `type` list is unwrapped to a bare
/// string.
pub fn normalize_json(data: &Value) -> AppResult<Mf2Entry> {
    let h_type = data
        .get("type")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .ok_or_else(|| AppError::BadRequest("Missing or invalid type".into()))?
        .to_string();

    let mut properties: HashMap<String, Vec<Value>> = HashMap::new();
    if let Some(props) = data.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in props {
            let values = match value {
                Value::Array(list) => list.clone(),
                other => vec![other.clone()],
            };
            properties.insert(underscore(key), values);
        }
    }

    Ok(Mf2Entry { h_type, properties })
}

/// Microformat property names use hyphens (`in-reply-to`); internally we use
/// underscores throughout.
fn underscore(key: &str) -> String {
    key.replace('-', "_")
}
