//! Layered engine configuration.
//!
//! YAML documents merge in order (earlier docs are base, later docs
//! override), the merged document is canonicalized (recursively sorted
//! keys, compact JSON) and hashed, and leaf strings are scanned for
//! secret-shaped literals — credentials belong in the environment, never
//! in config files. The daemon logs the config hash at boot so every run
//! is attributable to an exact configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading aborts with
/// CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // Stripe / OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "gho_",       // GitHub OAuth
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
    "xoxp-",      // Slack user token
];

// ---------------------------------------------------------------------------
// Typed engine section
// ---------------------------------------------------------------------------

/// Typed view of the `engine:` section of the merged config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address the daemon binds to.
    pub bind_addr: String,
    /// Path of the hash-chained audit log; empty disables auditing.
    pub audit_log_path: String,
    /// Whether audit events carry the SHA-256 hash chain.
    pub audit_hash_chain: bool,
    /// Default retention percentage applied when a create request omits
    /// one.
    pub default_retention_percentage: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8360".to_string(),
            audit_log_path: String::new(),
            audit_hash_chain: true,
            default_retention_percentage: 10,
        }
    }
}

impl EngineConfig {
    /// Extract the typed `engine:` section from a merged config document.
    /// A missing section yields the defaults.
    pub fn from_config(config_json: &Value) -> Result<Self> {
        match config_json.get("engine") {
            Some(section) => serde_json::from_value(section.clone())
                .context("invalid engine config section"),
            None => Ok(Self::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Layered loading + hashing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

/// Load and merge YAML files in order (base first, overrides later).
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw = fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }
    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

/// Same as [`load_layered_yaml`] over in-memory documents; used by tests
/// and by tools that assemble configs programmatically.
pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// Compact JSON with recursively sorted keys — the hashing basis must not
/// depend on map insertion order.
fn canonicalize_json(v: &Value) -> Result<String> {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).context("canonical json serialize failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Secret scan
// ---------------------------------------------------------------------------

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        if let Some(val) = v.pointer(&ptr) {
            if let Some(s) = val.as_str() {
                if looks_like_secret(s) {
                    bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
                }
            }
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                let ptr = format!("{prefix}/{}", escape_pointer_token(k));
                collect_leaf_pointers(child, &ptr, out);
            }
        }
        Value::Array(arr) => {
            for (i, child) in arr.iter().enumerate() {
                let ptr = format!("{prefix}/{i}");
                collect_leaf_pointers(child, &ptr, out);
            }
        }
        _ => out.push(prefix.to_string()),
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_override_earlier() {
        let base = "engine:\n  bind_addr: 0.0.0.0:8360\n  default_retention_percentage: 10\n";
        let env = "engine:\n  default_retention_percentage: 5\n";
        let loaded = load_layered_yaml_from_strings(&[base, env]).unwrap();
        let engine = EngineConfig::from_config(&loaded.config_json).unwrap();

        assert_eq!(engine.bind_addr, "0.0.0.0:8360");
        assert_eq!(engine.default_retention_percentage, 5);
    }

    #[test]
    fn missing_engine_section_uses_defaults() {
        let loaded = load_layered_yaml_from_strings(&["other: {}\n"]).unwrap();
        let engine = EngineConfig::from_config(&loaded.config_json).unwrap();
        assert_eq!(engine, EngineConfig::default());
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = "engine:\n  bind_addr: x\n  audit_hash_chain: true\n";
        let b = "engine:\n  audit_hash_chain: true\n  bind_addr: x\n";
        let ha = load_layered_yaml_from_strings(&[a]).unwrap().config_hash;
        let hb = load_layered_yaml_from_strings(&[b]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = load_layered_yaml_from_strings(&["engine:\n  bind_addr: x\n"]).unwrap();
        let b = load_layered_yaml_from_strings(&["engine:\n  bind_addr: y\n"]).unwrap();
        assert_ne!(a.config_hash, b.config_hash);
    }

    #[test]
    fn secret_literals_are_rejected() {
        let doc = "processor:\n  api_key: sk_live_abcdef123456\n";
        let err = load_layered_yaml_from_strings(&[doc]).unwrap_err();
        assert!(err.to_string().contains("CONFIG_SECRET_DETECTED"));
        // The secret value itself must not leak into the error.
        assert!(!err.to_string().contains("abcdef123456"));
    }

    #[test]
    fn short_strings_are_not_secrets() {
        let doc = "engine:\n  bind_addr: sk-1\n";
        assert!(load_layered_yaml_from_strings(&[doc]).is_ok());
    }
}
