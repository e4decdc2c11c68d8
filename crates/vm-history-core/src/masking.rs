//! # Sensitive Data Masking
//!
//! Redacts secret-like values inside structured data before it is stored in
//! the history or written to logs.
//!
//! Keys are matched by case-insensitive substring against a configurable
//! keyword list. String values under a matching key keep only their trailing
//! characters visible; everything else is replaced by the mask character.
//! Masking is irreversible and idempotent: masking an already masked value
//! yields the same value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keywords that mark a field as sensitive when no configuration is given
pub const DEFAULT_SENSITIVE_KEYWORDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "private_key",
    "access_key",
    "credentials_json",
];

/// Masking behaviour configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// Character used to replace hidden characters
    pub mask_char: char,

    /// Number of trailing characters left visible
    pub visible_suffix_len: usize,

    /// Case-insensitive substrings identifying sensitive keys
    pub sensitive_keywords: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            mask_char: '*',
            visible_suffix_len: 4,
            sensitive_keywords: DEFAULT_SENSITIVE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

/// Recursive redaction of sensitive fields in JSON-like structures
///
/// The masker is read-only after construction and can be shared freely
/// between threads.
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use vm_history_core::{MaskingConfig, SensitiveDataMasker};
///
/// let masker = SensitiveDataMasker::new(&MaskingConfig::default());
/// let masked = masker.mask(&json!({"password": "hunter2-secret", "region": "eu-west-1"}));
///
/// assert_eq!(masked["password"], "**********cret");
/// assert_eq!(masked["region"], "eu-west-1");
/// ```
#[derive(Debug, Clone)]
pub struct SensitiveDataMasker {
    keywords: Vec<String>,
    mask_char: char,
    visible_suffix_len: usize,
}

impl SensitiveDataMasker {
    /// Build a masker from configuration
    pub fn new(config: &MaskingConfig) -> Self {
        Self {
            keywords: config
                .sensitive_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            mask_char: config.mask_char,
            visible_suffix_len: config.visible_suffix_len,
        }
    }

    /// Check whether a key name matches one of the sensitive keywords
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.keywords.iter().any(|keyword| key.contains(keyword))
    }

    /// Mask a structure using the configured mask character and suffix length
    pub fn mask(&self, value: &Value) -> Value {
        self.mask_with(value, self.mask_char, self.visible_suffix_len)
    }

    /// Mask a structure with an explicit mask character and suffix length
    ///
    /// Only mappings are inspected. A top-level string, list or scalar is
    /// returned unchanged because there is no key name to judge it by.
    pub fn mask_with(&self, value: &Value, mask_char: char, visible_suffix_len: usize) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.mask_map(map, mask_char, visible_suffix_len)),
            other => other.clone(),
        }
    }

    /// Serialize a value and mask the result
    pub fn mask_serializable<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Value, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.mask(&value))
    }

    /// Mask a single secret string with the configured settings
    pub fn mask_value(&self, secret: &str) -> String {
        mask_secret(secret, self.mask_char, self.visible_suffix_len)
    }

    fn mask_map(
        &self,
        map: &Map<String, Value>,
        mask_char: char,
        visible_suffix_len: usize,
    ) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let sensitive = self.is_sensitive_key(key);
                let masked = self.mask_entry(sensitive, value, mask_char, visible_suffix_len);
                (key.clone(), masked)
            })
            .collect()
    }

    fn mask_entry(
        &self,
        sensitive: bool,
        value: &Value,
        mask_char: char,
        visible_suffix_len: usize,
    ) -> Value {
        match value {
            Value::String(s) if sensitive => {
                Value::String(mask_secret(s, mask_char, visible_suffix_len))
            }
            // Nested mappings are judged by their own keys
            Value::Object(map) => Value::Object(self.mask_map(map, mask_char, visible_suffix_len)),
            // List elements inherit the sensitivity of the key that owns the list
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.mask_entry(sensitive, item, mask_char, visible_suffix_len))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl Default for SensitiveDataMasker {
    fn default() -> Self {
        Self::new(&MaskingConfig::default())
    }
}

/// Replace all but the last `visible_suffix_len` characters with `mask_char`
///
/// Values no longer than the visible suffix are masked completely so that
/// short secrets never leak.
pub fn mask_secret(secret: &str, mask_char: char, visible_suffix_len: usize) -> String {
    let len = secret.chars().count();
    if len <= visible_suffix_len {
        return std::iter::repeat(mask_char).take(len).collect();
    }

    let hidden = len - visible_suffix_len;
    std::iter::repeat(mask_char)
        .take(hidden)
        .chain(secret.chars().skip(hidden))
        .collect()
}

#[cfg(test)]
#[path = "masking_tests.rs"]
mod tests;
