//! Response-header maps as stored in result files.
//!
//! The probe writes headers as a JSON object with the server's original
//! casing. Classification wants case-insensitive lookups, so names are
//! lower-cased on decode.

use std::collections::HashMap;

use crate::error::HeaderDecodeError;

/// Lower-cased header name → raw value. Built per row, consumed once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    inner: HashMap<String, String>,
}

impl HeaderMap {
    /// Decode the `responseHeaders` column.
    ///
    /// Non-string JSON values are kept in their JSON text form; anything that
    /// is not a JSON object is undecodable.
    pub fn decode(raw: &str) -> Result<Self, HeaderDecodeError> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw.trim())
            .map_err(|e| HeaderDecodeError(e.to_string()))?;

        let inner = map
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k.to_lowercase(), value)
            })
            .collect();
        Ok(Self { inner })
    }

    #[cfg(test)]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let inner = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
            .collect();
        Self { inner }
    }

    /// Look up a header by (lower-case) name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
