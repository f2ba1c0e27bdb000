use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit trace id, rendered as 32 lowercase hex chars (§3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts an externally supplied id (from an inbound `traceparent`),
    /// normalizing to lowercase. Callers validate shape before constructing.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 64-bit span id, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(String);

impl SpanId {
    pub fn generate() -> Self {
        let full = Uuid::new_v4().simple().to_string();
        Self(full[..16].to_string())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        let s: String = hex.into().to_lowercase();
        // §4.10: "truncate span IDs >16 hex to leading 16" on emit; stored
        // ids are kept as provided and truncated only when formatted.
        Self(s)
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 16 hex chars, per the W3C emit-time truncation rule.
    pub fn truncated(&self) -> String {
        if self.0.len() > 16 {
            self.0[..16].to_string()
        } else {
            self.0.clone()
        }
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.truncated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_correct_length() {
        assert_eq!(TraceId::generate().as_str().len(), 32);
        assert_eq!(SpanId::generate().as_str().len(), 16);
    }

    #[test]
    fn overlong_span_id_truncates_to_16_on_display() {
        let long = SpanId::from_hex("0123456789abcdef0123456789abcdef");
        assert_eq!(long.truncated().len(), 16);
        assert_eq!(long.truncated(), "0123456789abcdef");
    }
}
