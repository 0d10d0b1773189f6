//! Normalization of reasoning-backend replies into parseable JSON.
use serde::de::DeserializeOwned;
use tracing::warn;

const FENCE: &str = "```";

fn is_json(s: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(s).is_ok()
}

/// Content between the first and last fence, without a leading language tag.
fn strip_fence(s: &str) -> Option<&str> {
    let first = s.find(FENCE)?;
    let after = &s[first + FENCE.len()..];
    let inner = match after.rfind(FENCE) {
        Some(last) => &after[..last],
        None => after,
    };
    // A tag is whatever word follows the opening fence on its line
    let inner = match inner.split_once('\n') {
        Some((tag, rest)) if !tag.trim_start().starts_with(['{', '[']) => rest,
        _ => inner,
    };
    Some(inner.trim())
}

fn strip_backticks(s: &str) -> Option<&str> {
    s.strip_prefix('`')
        .and_then(|rest| rest.strip_suffix('`'))
        .map(str::trim)
}

/// Reduce a reply to a JSON document. Replies that cannot be reduced come
/// back as `{}` after a warning carrying the raw text.
pub fn clean_response(raw: &str) -> String {
    let trimmed = raw.trim();
    if is_json(trimmed) {
        return trimmed.to_string();
    }
    let candidate = if trimmed.contains(FENCE) {
        strip_fence(trimmed).unwrap_or(trimmed)
    } else {
        strip_backticks(trimmed).unwrap_or(trimmed)
    };
    if is_json(candidate) {
        candidate.to_string()
    } else {
        warn!(raw = %raw, "reasoning reply is not JSON; using empty object");
        "{}".to_string()
    }
}

/// Clean and decode a reply. Anything that does not fit `T` yields
/// `T::default()`.
pub fn parse_or_default<T: DeserializeOwned + Default>(agent: &str, raw: &str) -> T {
    let cleaned = clean_response(raw);
    match serde_json::from_str::<T>(&cleaned) {
        Ok(v) => v,
        Err(e) => {
            warn!(agent, error = %e, raw = %raw, "reasoning reply did not match the expected shape");
            T::default()
        }
    }
}
