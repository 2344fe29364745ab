//! Upstream registry: validated `{pattern, server, error-message, extras}`
//! entries and hostname-to-upstream matching.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::chat::ChatMessage;

const VALID_HOST_CHARS: &str = "0123456789abcdefghijklmnopqrstuvwxyz.-";
const VALID_PATTERN_CHARS: &str = "0123456789abcdefghijklmnopqrstuvwxyz.-*?";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageFields {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underlined: bool,
    #[serde(default)]
    pub strikethrough: bool,
    #[serde(default)]
    pub hover: String,
    #[serde(default)]
    pub click: String,
}

impl ChatMessageFields {
    pub fn to_chat_message(&self) -> ChatMessage {
        let mut msg = ChatMessage::new(self.text.clone());
        if !self.color.is_empty() {
            msg.set_color(&self.color.to_ascii_lowercase());
        }
        msg.set_bold(self.bold);
        msg.set_italic(self.italic);
        msg.set_underlined(self.underlined);
        msg.set_strikethrough(self.strikethrough);
        if !self.hover.is_empty() {
            msg.hover_text(self.hover.clone());
        }
        if !self.click.is_empty() {
            msg.click_target(self.click.clone());
        }
        msg
    }
}

/// Raw, not-yet-validated upstream entry as deserialized from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub hostname: String,
    pub upstream: String,
    #[serde(default)]
    pub onerror: ChatMessageFields,
    /// Path to a per-upstream favicon image; falls back to the global
    /// `icon` config key when absent.
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// A validated upstream entry, ready to be matched against and dialed.
#[derive(Debug, Clone)]
pub struct UpstreamEntry {
    pub pattern: String,
    pub server: String,
    pub error_msg: ChatMessage,
    pub icon_path: Option<String>,
    /// Resized, base64-encoded favicon, resolved from `icon_path` (or the
    /// config's global icon) by the config loader once `icon_path` is known
    /// to exist on disk.
    pub favicon: Option<String>,
    pub extras: Map<String, Value>,
}

impl UpstreamEntry {
    /// Validates and normalizes a raw config entry.
    /// Returns `None` (logging the reason) if the entry cannot be activated.
    pub fn from_config(mut raw: UpstreamConfig) -> Option<Self> {
        let server = match normalize_server(&raw.upstream) {
            Some(s) => s,
            None => {
                log::error!("invalid upstream server: {}", raw.upstream);
                return None;
            }
        };

        let pattern = raw.hostname.to_ascii_lowercase();
        if !check_pattern(&pattern) {
            log::error!("invalid pattern: {pattern}");
            return None;
        }

        if raw.onerror.text.is_empty() {
            log::warn!("empty error text for {server}, using default string");
            raw.onerror.text = format!("Connection failed to {server}");
        }
        let error_msg = raw.onerror.to_chat_message();

        Some(UpstreamEntry {
            pattern,
            server,
            error_msg,
            icon_path: raw.icon,
            favicon: None,
            extras: raw.extras,
        })
    }
}

/// Splits `host[:port]`, defaulting the port to 25565, lowercasing the host,
/// and validating both the host charset and the port range.
fn normalize_server(spec: &str) -> Option<String> {
    let (host, port_str) = match spec.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => (h, p),
        _ => (spec, "25565"),
    };
    let port: u32 = port_str.parse().ok()?;
    if port == 0 || port > 65535 {
        return None;
    }
    let host = host.to_ascii_lowercase();
    if !check_host(&host) {
        return None;
    }
    Some(format!("{host}:{port}"))
}

fn check_host(host: &str) -> bool {
    !host.is_empty() && host.chars().all(|c| VALID_HOST_CHARS.contains(c))
}

fn check_pattern(pattern: &str) -> bool {
    !pattern.is_empty() && pattern.chars().all(|c| VALID_PATTERN_CHARS.contains(c))
}

/// Anchored glob match: `*` matches any run of characters, `?` matches
/// exactly one. Classic two-pointer wildcard matcher.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let (mut star_idx, mut star_match) = (None, 0);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_idx = Some(pi);
            star_match = ti;
            pi += 1;
        } else if let Some(si) = star_idx {
            pi = si + 1;
            star_match += 1;
            ti = star_match;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[derive(Debug, Error)]
pub enum ExtraError {
    #[error("key {0:?} not found or not a map")]
    NotAMap(String),
    #[error("unparsable index: {0:?}")]
    BadIndex(String),
    #[error("value is not a sequence")]
    NotASequence,
    #[error("index {0} out of range")]
    IndexOutOfRange(usize),
}

/// Resolves `segment('.'segment)*` where `segment := key('#'index)*`,
/// alternating map-key and sequence-index lookups.
pub fn get_extra<'a>(extras: &'a Map<String, Value>, path: &str) -> Result<&'a Value, ExtraError> {
    let mut segments = path.split('.');
    let first = segments.next().unwrap_or("");
    let mut parts = first.split('#');
    let key = parts.next().unwrap_or("");
    let mut current = extras
        .get(key)
        .ok_or_else(|| ExtraError::NotAMap(key.to_owned()))?;
    for idx_str in parts {
        current = index_sequence(current, idx_str)?;
    }

    for segment in segments {
        let mut parts = segment.split('#');
        let key = parts.next().unwrap_or("");
        let map = current
            .as_object()
            .ok_or_else(|| ExtraError::NotAMap(key.to_owned()))?;
        current = map
            .get(key)
            .ok_or_else(|| ExtraError::NotAMap(key.to_owned()))?;
        for idx_str in parts {
            current = index_sequence(current, idx_str)?;
        }
    }
    Ok(current)
}

fn index_sequence<'a>(value: &'a Value, idx_str: &str) -> Result<&'a Value, ExtraError> {
    let idx: usize = idx_str
        .parse()
        .map_err(|_| ExtraError::BadIndex(idx_str.to_owned()))?;
    let seq = value.as_array().ok_or(ExtraError::NotASequence)?;
    seq.get(idx).ok_or(ExtraError::IndexOutOfRange(idx))
}

pub fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => {
            let lower = s.to_ascii_lowercase();
            Some(matches!(lower.as_str(), "true" | "yes" | "on" | "y"))
        }
        _ => None,
    }
}

pub fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Bool(b) => Some(if *b { 1 } else { 0 }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn to_uint(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::Bool(b) => Some(if *b { 1 } else { 0 }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The validated, matchable list of upstreams plus the two "nowhere to
/// route" chat messages (bad host / not found).
#[derive(Debug, Clone)]
pub struct UpstreamRegistry {
    pub entries: Vec<UpstreamEntry>,
    pub bad_host: ChatMessage,
    pub host_not_found: ChatMessage,
}

impl UpstreamRegistry {
    /// Returns the first upstream (in declaration order) whose pattern
    /// glob-matches `hostname`, or the appropriate rejection chat message.
    pub fn get(&self, hostname: &str) -> Result<&UpstreamEntry, &ChatMessage> {
        let hostname = hostname.to_ascii_lowercase();
        if !check_host(&hostname) {
            return Err(&self.bad_host);
        }
        self.entries
            .iter()
            .find(|u| glob_match(&u.pattern, &hostname))
            .ok_or(&self.host_not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str, server: &str) -> UpstreamEntry {
        UpstreamEntry {
            pattern: pattern.to_owned(),
            server: server.to_owned(),
            error_msg: ChatMessage::new("err"),
            icon_path: None,
            favicon: None,
            extras: Map::new(),
        }
    }

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match("*.local", "server1.local"));
        assert!(!glob_match("*.local", "server1.localx"));
        assert!(glob_match("srv?.local", "srv1.local"));
        assert!(!glob_match("srv?.local", "srv12.local"));
        assert!(glob_match("*", "anything.at.all"));
    }

    #[test]
    fn first_declared_match_wins() {
        let registry = UpstreamRegistry {
            entries: vec![entry("*.local", "a:1"), entry("server1.local", "b:2")],
            bad_host: ChatMessage::new("bad"),
            host_not_found: ChatMessage::new("nf"),
        };
        let found = registry.get("server1.local").unwrap();
        assert_eq!(found.server, "a:1");
    }

    #[test]
    fn invalid_host_char_rejected_before_list_scan() {
        let registry = UpstreamRegistry {
            entries: vec![entry("*", "a:1")],
            bad_host: ChatMessage::new("bad"),
            host_not_found: ChatMessage::new("nf"),
        };
        let err = registry.get("bad host!").unwrap_err();
        assert_eq!(err.text, "bad");
    }

    #[test]
    fn normalize_server_defaults_port() {
        assert_eq!(
            normalize_server("1.2.3.4").as_deref(),
            Some("1.2.3.4:25565")
        );
        assert_eq!(normalize_server("1.2.3.4:65537"), None);
        assert_eq!(normalize_server("1.2.3.4:-1"), None);
    }

    #[test]
    fn extras_path_resolves_nested_sequence_index() {
        let json = serde_json::json!({"a": {"b": [{"c": 42}]}});
        let map = json.as_object().unwrap().clone();
        let value = get_extra(&map, "a.b#0.c").unwrap();
        assert_eq!(value, &serde_json::json!(42));
    }

    #[test]
    fn extras_path_type_mismatch_is_typed_error_not_crash() {
        let json = serde_json::json!({"a": 5});
        let map = json.as_object().unwrap().clone();
        assert!(get_extra(&map, "a.b").is_err());
        assert!(get_extra(&map, "a#0").is_err());
    }

    #[test]
    fn permissive_bool_conversion() {
        assert_eq!(to_bool(&Value::String("yes".into())), Some(true));
        assert_eq!(to_bool(&Value::String("no".into())), Some(false));
        assert_eq!(to_bool(&Value::Bool(true)), Some(true));
    }
}
