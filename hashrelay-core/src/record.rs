//! Pending detection records and the scanner-facing detection shape.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Digest type assumed when the scanner does not name one.
pub const DEFAULT_HASH_TYPE: &str = "sha256";

/// One detected artifact awaiting upload.
///
/// Field names on disk and on the wire follow the collector's report schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub hash: String,

    #[serde(rename = "type", default = "default_hash_type")]
    pub hash_type: String,

    #[serde(rename = "malware_name", default)]
    pub label: String,

    #[serde(default)]
    pub rule_match: String,
}

fn default_hash_type() -> String {
    DEFAULT_HASH_TYPE.to_string()
}

impl PendingRecord {
    /// Record with the default hash type and no label or rules.
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            hash_type: default_hash_type(),
            label: String::new(),
            rule_match: String::new(),
        }
    }

    pub fn with_type(mut self, hash_type: impl Into<String>) -> Self {
        self.hash_type = hash_type.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set the rule match from a list of rule identifiers.
    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.rule_match = join_rules(rules);
        self
    }

    /// Reject records the collector cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.hash.trim().is_empty() {
            return Err(Error::InvalidRecord("hash must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Join rule identifiers as `"a, b"`, dropping blank entries.
pub fn join_rules<I, S>(rules: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .filter_map(|r| {
            let r = r.as_ref().trim();
            (!r.is_empty()).then(|| r.to_string())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A scanner detection: one artifact, possibly with several digests.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// `(hash_type, value)` pairs, e.g. `("md5", "…")`
    pub digests: Vec<(String, String)>,
    pub label: String,
    pub rules: Vec<String>,
}

impl Detection {
    /// One pending record per non-empty digest.
    pub fn records(&self) -> Vec<PendingRecord> {
        let rule_match = join_rules(&self.rules);
        self.digests
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(hash_type, value)| PendingRecord {
                hash: value.trim().to_string(),
                hash_type: hash_type.clone(),
                label: self.label.clone(),
                rule_match: rule_match.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let record = PendingRecord::new("abc123")
            .with_label("Trojan.X")
            .with_rules(["RULE_1"]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "hash": "abc123",
                "type": "sha256",
                "malware_name": "Trojan.X",
                "rule_match": "RULE_1",
            })
        );
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let record: PendingRecord = serde_json::from_str(r#"{"hash":"ff00"}"#).unwrap();
        assert_eq!(record.hash_type, "sha256");
        assert_eq!(record.label, "");
        assert_eq!(record.rule_match, "");
    }

    #[test]
    fn test_join_rules_drops_blanks() {
        assert_eq!(join_rules([" A ", "", "B", "  "]), "A, B");
        assert_eq!(join_rules(Vec::<String>::new()), "");
    }

    #[test]
    fn test_validate_rejects_empty_hash() {
        assert!(PendingRecord::new("  ").validate().is_err());
        assert!(PendingRecord::new("abc").validate().is_ok());
    }

    #[test]
    fn test_detection_expands_each_digest() {
        let detection = Detection {
            digests: vec![
                ("md5".to_string(), "d41d8c".to_string()),
                ("sha1".to_string(), String::new()),
                ("sha256".to_string(), "e3b0c4".to_string()),
            ],
            label: "sample.exe".to_string(),
            rules: vec!["Rule_A".to_string(), "Rule_B".to_string()],
        };

        let records = detection.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hash_type, "md5");
        assert_eq!(records[1].hash, "e3b0c4");
        assert!(records.iter().all(|r| r.rule_match == "Rule_A, Rule_B"));
        assert!(records.iter().all(|r| r.label == "sample.exe"));
    }
}
