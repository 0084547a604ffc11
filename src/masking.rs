//! Sensitive-data masking applied to caller-supplied context before a
//! record leaves the process.

use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Replacement written in place of any sensitive value.
pub const MASKED: &str = "***MASKED***";

/// Suffix appended to strings cut by [`truncate_strings`].
pub const TRUNCATED_MARKER: &str = "...[truncated]";

const MAX_MASK_CHARS: usize = 8;

/// Keywords matched (exactly or as substrings) against normalized field
/// names when no override file is configured.
pub const DEFAULT_SENSITIVE_KEYWORDS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "key",
    "auth",
    "authorization",
    "cookie",
    "session",
    "ssn",
    "creditcard",
    "cardnumber",
    "cvv",
    "cvc",
    "pin",
    "otp",
    "apikey",
    "privatekey",
    "email",
    "phone",
    "iban",
];

/// Accepted layouts of the sensitive-fields override file.
#[derive(Deserialize)]
#[serde(untagged)]
enum SensitiveFieldsFile {
    List(Vec<String>),
    Structured {
        #[serde(default)]
        categories: HashMap<String, Vec<String>>,
        #[serde(default, rename = "fieldPatterns")]
        field_patterns: Vec<String>,
    },
}

/// Recursive masker over JSON values keyed by a configurable keyword set.
///
/// The input is never mutated: every operation returns a fresh value.
#[derive(Debug, Clone)]
pub struct DataMasker {
    keywords: BTreeSet<String>,
}

impl Default for DataMasker {
    fn default() -> Self {
        Self::with_keywords(DEFAULT_SENSITIVE_KEYWORDS.iter().copied())
    }
}

impl DataMasker {
    /// Build a masker from an explicit keyword set. Keywords are normalized
    /// the same way field names are.
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| normalize(k.as_ref()))
            .filter(|k| !k.is_empty())
            .collect();
        DataMasker { keywords }
    }

    /// Load the keyword set from a JSON file, replacing the defaults.
    ///
    /// The file holds either a plain array of keywords or an object with
    /// `categories` (name → keywords) and/or `fieldPatterns`.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::SensitiveFieldsIo {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: SensitiveFieldsFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::SensitiveFieldsFormat {
                path: path.to_path_buf(),
                source,
            })?;

        let keywords: Vec<String> = match parsed {
            SensitiveFieldsFile::List(list) => list,
            SensitiveFieldsFile::Structured {
                categories,
                field_patterns,
            } => categories.into_values().flatten().chain(field_patterns).collect(),
        };
        Ok(Self::with_keywords(keywords))
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }

    /// Whether `name`, once lowercased and stripped of `_`/`-`, equals or
    /// contains any configured keyword.
    pub fn is_sensitive_field(&self, name: &str) -> bool {
        let normalized = normalize(name);
        if normalized.is_empty() {
            return false;
        }
        self.keywords
            .iter()
            .any(|k| normalized == *k || normalized.contains(k.as_str()))
    }

    /// Return a copy of `value` with every sensitive mapping entry replaced
    /// by [`MASKED`]. Sensitive entries are not descended into.
    pub fn mask_sensitive_data(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.mask_map(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.mask_sensitive_data(v)).collect())
            }
            other => other.clone(),
        }
    }

    /// Mapping-level variant of [`DataMasker::mask_sensitive_data`].
    pub fn mask_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| {
                let masked = if self.is_sensitive_field(k) {
                    Value::String(MASKED.to_string())
                } else {
                    self.mask_sensitive_data(v)
                };
                (k.clone(), masked)
            })
            .collect()
    }

    /// True as soon as any mapping key anywhere in `value` is sensitive.
    pub fn contains_sensitive_data(&self, value: &Value) -> bool {
        match value {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| self.is_sensitive_field(k) || self.contains_sensitive_data(v)),
            Value::Array(items) => items.iter().any(|v| self.contains_sensitive_data(v)),
            _ => false,
        }
    }

    /// Mask `map` unless its serialized size exceeds `max_masking_size`, in
    /// which case the whole mapping is replaced by a placeholder carrying
    /// only the original size.
    pub fn mask_map_bounded(&self, map: &Map<String, Value>, max_masking_size: usize) -> Map<String, Value> {
        // Size estimation failing falls back to a regular walk.
        let size = serde_json::to_vec(map).map(|b| b.len()).unwrap_or(0);
        if size > max_masking_size {
            let mut placeholder = Map::new();
            placeholder.insert("_masked".to_string(), Value::String(MASKED.to_string()));
            placeholder.insert("_originalSize".to_string(), Value::from(size as u64));
            return placeholder;
        }
        self.mask_map(map)
    }
}

/// Partially reveal `value`: the first `show_first` and last `show_last`
/// characters are kept with at most eight `*` in between. When nothing
/// would remain hidden the whole value becomes [`MASKED`].
pub fn mask_value(value: &str, show_first: usize, show_last: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    let hidden = chars.len() as isize - show_first as isize - show_last as isize;
    if hidden <= 0 {
        return MASKED.to_string();
    }

    let head: String = chars[..show_first].iter().collect();
    let tail: String = chars[chars.len() - show_last..].iter().collect();
    let stars = "*".repeat((hidden as usize).min(MAX_MASK_CHARS));
    format!("{}{}{}", head, stars, tail)
}

/// Cut every string longer than `max_len` characters, recursively.
pub fn truncate_strings(value: &Value, max_len: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > max_len => {
            let mut cut: String = s.chars().take(max_len).collect();
            cut.push_str(TRUNCATED_MARKER);
            Value::String(cut)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_strings(v, max_len)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| truncate_strings(v, max_len)).collect()),
        other => other.clone(),
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn masked_keys(value: &Value, prefix: &str, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let path = format!("{}/{}", prefix, k);
                    if v == MASKED {
                        out.push(path.clone());
                    }
                    masked_keys(v, &path, out);
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    masked_keys(v, &format!("{}/{}", prefix, i), out);
                }
            }
            _ => {}
        }
    }

    #[test]
    fn key_name_variants_are_sensitive() {
        let masker = DataMasker::default();
        for name in ["api_key", "api-key", "apikey", "API_KEY", "userPassword", "X-Auth-Token"] {
            assert!(masker.is_sensitive_field(name), "{name} should be sensitive");
        }
        for name in ["userId", "action", "resource", "count", ""] {
            assert!(!masker.is_sensitive_field(name), "{name} should not be sensitive");
        }
    }

    #[test]
    fn masks_nested_structures_without_mutating_input() {
        let masker = DataMasker::default();
        let input = json!({
            "userId": "u1",
            "password": "hunter2",
            "profile": { "email": "a@b.c", "name": "Ann" },
            "items": [ { "token": "t" }, 3, null ],
            "credentials": { "nested": { "x": 1 } },
        });
        let before = input.clone();

        let out = masker.mask_sensitive_data(&input);

        assert_eq!(input, before);
        assert_eq!(out["userId"], "u1");
        assert_eq!(out["password"], MASKED);
        assert_eq!(out["profile"]["email"], MASKED);
        assert_eq!(out["profile"]["name"], "Ann");
        assert_eq!(out["items"][0]["token"], MASKED);
        assert_eq!(out["items"][1], 3);
        assert_eq!(out["items"][2], Value::Null);
    }

    #[test]
    fn sensitive_subtrees_are_replaced_whole() {
        let masker = DataMasker::default();
        let out = masker.mask_sensitive_data(&json!({ "auth": { "user": "a", "nested": [1, 2] } }));
        assert_eq!(out, json!({ "auth": MASKED }));
    }

    #[test]
    fn masking_is_idempotent() {
        let masker = DataMasker::default();
        let input = json!({
            "secret": "s",
            "a": { "sessionId": "x", "b": [ { "pin": 1234 } ] },
            "plain": "value",
        });

        let once = masker.mask_sensitive_data(&input);
        let twice = masker.mask_sensitive_data(&once);

        let (mut first, mut second) = (Vec::new(), Vec::new());
        masked_keys(&once, "", &mut first);
        masked_keys(&twice, "", &mut second);
        assert_eq!(first, second);
        assert_eq!(once, twice);
    }

    #[test]
    fn primitives_and_null_pass_through() {
        let masker = DataMasker::default();
        assert_eq!(masker.mask_sensitive_data(&Value::Null), Value::Null);
        assert_eq!(masker.mask_sensitive_data(&json!("password")), json!("password"));
        assert_eq!(masker.mask_sensitive_data(&json!(42)), json!(42));
    }

    #[test]
    fn detects_sensitive_data_anywhere() {
        let masker = DataMasker::default();
        assert!(masker.contains_sensitive_data(&json!({ "a": [ { "b": { "cookie": 1 } } ] })));
        assert!(!masker.contains_sensitive_data(&json!({ "a": [ { "b": "password" } ] })));
        assert!(!masker.contains_sensitive_data(&json!("token")));
    }

    #[test]
    fn partial_reveal() {
        assert_eq!(mask_value("4111111111111111", 4, 4), "4111********1111");
        assert_eq!(mask_value("abcdefgh", 2, 2), "ab****gh");
        assert_eq!(mask_value("abcd", 2, 2), MASKED);
        assert_eq!(mask_value("abc", 2, 2), MASKED);
        assert_eq!(mask_value("", 0, 0), MASKED);
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let masker = DataMasker::with_keywords(["Tax_Id"]);
        assert!(masker.is_sensitive_field("customerTaxId"));
        assert!(!masker.is_sensitive_field("password"));
    }

    #[test]
    fn loads_both_config_layouts() {
        let dir = std::env::temp_dir();

        let list_path = dir.join(format!("sensitive-list-{}.json", std::process::id()));
        std::fs::write(&list_path, r#"["iban", "tax-id"]"#).unwrap();
        let masker = DataMasker::from_config_file(&list_path).unwrap();
        assert!(masker.is_sensitive_field("TAX_ID"));
        assert!(!masker.is_sensitive_field("password"));

        let structured_path = dir.join(format!("sensitive-structured-{}.json", std::process::id()));
        std::fs::write(
            &structured_path,
            r#"{ "categories": { "auth": ["password"], "pii": ["dob"] }, "fieldPatterns": ["salary"] }"#,
        )
        .unwrap();
        let masker = DataMasker::from_config_file(&structured_path).unwrap();
        assert!(masker.is_sensitive_field("dateDob"));
        assert!(masker.is_sensitive_field("baseSalary"));
        assert!(masker.is_sensitive_field("password"));

        let _ = std::fs::remove_file(list_path);
        let _ = std::fs::remove_file(structured_path);
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let err = DataMasker::from_config_file("/nonexistent/sensitive.json").unwrap_err();
        assert!(matches!(err, ConfigError::SensitiveFieldsIo { .. }));
    }

    #[test]
    fn oversized_context_is_replaced_by_placeholder() {
        let masker = DataMasker::default();
        let map = json!({ "body": "x".repeat(200), "password": "p" });
        let map = map.as_object().unwrap();

        let bounded = masker.mask_map_bounded(map, 64);
        assert_eq!(bounded["_masked"], MASKED);
        assert!(bounded["_originalSize"].as_u64().unwrap() > 64);
        assert!(bounded.get("password").is_none());

        let small = masker.mask_map_bounded(map, 10_000);
        assert_eq!(small["password"], MASKED);
    }

    #[test]
    fn truncates_long_strings() {
        let out = truncate_strings(&json!({ "a": "abcdef", "b": ["xy", "longer"] }), 3);
        assert_eq!(out["a"], format!("abc{}", TRUNCATED_MARKER));
        assert_eq!(out["b"][0], "xy");
        assert_eq!(out["b"][1], format!("lon{}", TRUNCATED_MARKER));
    }
}
