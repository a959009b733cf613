//! Request fingerprinting for the response cache.
//!
//! A request is reduced to a canonical JSON document (model, ordered turns with
//! whitespace-normalized text, lexically sorted generation parameters) and
//! hashed with SHA-256. Parameters that do not influence the model output
//! (trace ids, callback references, streaming flags) never reach the digest.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::provider::CompletionRequest;

/// Parameter names stripped from `extra` before canonicalization.
pub const VOLATILE_PARAMS: &[&str] = &[
    "callback_manager",
    "callbacks",
    "metadata",
    "request_id",
    "run_id",
    "run_name",
    "stream",
    "tags",
    "trace_id",
    "user",
    "verbose",
];

const DIGEST_DOMAIN: &[u8] = b"delve-cache-v1\0";

/// Fixed-length (64 hex chars) digest identifying a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    fn digest(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        hasher.update(canonical.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Rehydrate a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Both digests of a request: the normalized lookup key and the digest a
/// naive exact-match cache would have used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: CacheKey,
    pub exact: CacheKey,
}

impl Fingerprint {
    /// True when the lookup key differs from the exact digest, i.e. the
    /// request only collides with other spellings after normalization.
    pub fn is_normalized(&self) -> bool {
        self.key != self.exact
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// Whitespace-normalized text, volatile params stripped.
    Normalized,
    /// Raw text and every parameter; lookups behave like a plain cache.
    Exact,
}

#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    ignored: BTreeSet<String>,
    mode: KeyMode,
}

impl Default for RequestNormalizer {
    fn default() -> Self {
        Self {
            ignored: VOLATILE_PARAMS.iter().map(|p| p.to_string()).collect(),
            mode: KeyMode::Normalized,
        }
    }
}

impl RequestNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: KeyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Treat an additional `extra` parameter as output-irrelevant.
    pub fn with_ignored_param(mut self, name: impl Into<String>) -> Self {
        self.ignored.insert(name.into());
        self
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn normalize(&self, request: &CompletionRequest) -> Result<CacheKey, Error> {
        Ok(self.fingerprint(request)?.key)
    }

    pub fn fingerprint(&self, request: &CompletionRequest) -> Result<Fingerprint, Error> {
        let exact = CacheKey::digest(&self.exact_form(request)?);
        let key = match self.mode {
            KeyMode::Normalized => CacheKey::digest(&self.canonical_form(request)?),
            KeyMode::Exact => exact.clone(),
        };
        Ok(Fingerprint { key, exact })
    }

    /// Canonical serialization fed to the digest in normalized mode.
    pub fn canonical_form(&self, request: &CompletionRequest) -> Result<String, Error> {
        let model = require_model(request)?.trim().to_string();

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut turn = BTreeMap::new();
                turn.insert("role", Value::from(m.role.as_str()));
                turn.insert("content", Value::from(normalize_text(&m.content)));
                if let Some(name) = &m.name {
                    turn.insert("name", Value::from(name.trim()));
                }
                serde_json::json!(turn)
            })
            .collect();

        let params = self.params(request, true);
        serialize(model, messages, params)
    }

    fn exact_form(&self, request: &CompletionRequest) -> Result<String, Error> {
        let model = require_model(request)?.to_string();

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content, "name": m.name }))
            .collect();

        let params = self.params(request, false);
        serialize(model, messages, params)
    }

    fn params(&self, request: &CompletionRequest, strip_volatile: bool) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();

        for (name, value) in &request.extra {
            if strip_volatile && self.ignored.contains(name) {
                continue;
            }
            params.insert(name.clone(), canonicalize_value(value));
        }

        // Typed fields win over same-named pass-through params.
        if let Some(t) = request.temperature {
            params.insert("temperature".to_string(), float_param(t));
        }
        if let Some(p) = request.top_p {
            params.insert("top_p".to_string(), float_param(p));
        }
        if let Some(m) = request.max_tokens {
            params.insert("max_tokens".to_string(), Value::from(m));
        }
        if !request.stop.is_empty() {
            params.insert("stop".to_string(), Value::from(request.stop.clone()));
        }

        params
    }
}

fn require_model(request: &CompletionRequest) -> Result<&str, Error> {
    request
        .model
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| Error::invalid_request("request has no model identifier"))
}

fn serialize(
    model: String,
    messages: Vec<Value>,
    params: BTreeMap<String, Value>,
) -> Result<String, Error> {
    let mut doc = BTreeMap::new();
    doc.insert("messages", Value::from(messages));
    doc.insert("model", Value::from(model));
    doc.insert("params", serde_json::to_value(params)?);
    Ok(serde_json::to_string(&doc)?)
}

/// Shortest decimal spelling of the f32, so 0.7f32 hashes as 0.7.
fn float_param(value: f32) -> Value {
    value
        .to_string()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Rebuild objects with lexically sorted keys, recursively.
fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(k, v)| (k, canonicalize_value(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

/// Collapse cosmetic whitespace differences in message text.
///
/// Line endings become `\n`, runs of spaces and tabs inside a line become a
/// single space, lines are trimmed, and any run of blank lines becomes a
/// single paragraph break. Leading and trailing blank lines are dropped.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut pending_break = false;

    for line in unified.split('\n') {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            pending_break = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if pending_break { "\n\n" } else { "\n" });
        }
        out.push_str(&words.join(" "));
        pending_break = false;
    }

    out
}
