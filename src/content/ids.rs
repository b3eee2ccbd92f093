// Canonical tool-call identifiers
//
// Internally every tool call is identified by `hist_tool_<token>`. Backends
// get their own prefix back on the way out (`call_` for OpenAI, `toolu_` for
// Anthropic, bare for Gemini) so the mapping is reversible.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};

pub const CANONICAL_PREFIX: &str = "hist_tool_";

/// Prefixes stripped when canonicalizing a backend-native id
const KNOWN_NATIVE_PREFIXES: &[&str] = &[CANONICAL_PREFIX, "call_", "toolu_", "tool_"];

const HASH_TOKEN_LEN: usize = 24;
const RANDOM_TOKEN_LEN: usize = 24;

static INVALID_ID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("id sanitizer regex must compile"));

pub fn is_canonical(id: &str) -> bool {
    id.strip_prefix(CANONICAL_PREFIX)
        .map(|token| !token.is_empty() && !INVALID_ID_CHARS.is_match(token))
        .unwrap_or(false)
}

/// Strip characters backends reject in tool ids
pub fn sanitize_token(raw: &str) -> String {
    INVALID_ID_CHARS.replace_all(raw.trim(), "").into_owned()
}

/// Fresh random token, used when an id sanitizes to nothing
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(RANDOM_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Deterministic canonical id for a tool call
///
/// All five inputs are hashed, so changing any one of them changes the id.
/// When a backend omits its raw id (`None`), the turn key and call index
/// still keep ids distinct across calls.
pub fn generate_canonical_id(
    turn_key: &str,
    call_index: usize,
    backend: &str,
    raw_id: Option<&str>,
    tool_name: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        backend,
        raw_id.unwrap_or("\u{0}none"),
        tool_name,
        turn_key,
        &call_index.to_string(),
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!("{}{}", CANONICAL_PREFIX, &hex[..HASH_TOKEN_LEN])
}

/// Map a backend-native id into the canonical namespace
///
/// `call_abc` and `toolu_abc` both become `hist_tool_abc`. Ids that sanitize
/// to an empty token get a random one instead.
pub fn canonicalize(native_id: &str) -> String {
    let trimmed = native_id.trim();
    let token = KNOWN_NATIVE_PREFIXES
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);

    let mut token = sanitize_token(token);
    if token.is_empty() {
        tracing::debug!(raw = native_id, "tool id sanitized to empty, generating a fresh one");
        token = random_token();
    }
    format!("{}{}", CANONICAL_PREFIX, token)
}

/// Map a canonical id back to a backend's native form
pub fn to_native(canonical_id: &str, native_prefix: &str) -> String {
    let token = canonical_id
        .strip_prefix(CANONICAL_PREFIX)
        .unwrap_or(canonical_id);

    let mut token = sanitize_token(token);
    if token.is_empty() {
        token = random_token();
    }
    format!("{}{}", native_prefix, token)
}
