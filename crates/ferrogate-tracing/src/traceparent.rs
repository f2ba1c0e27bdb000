use crate::ids::{SpanId, TraceId};

/// A parsed W3C `traceparent` header: `00-<trace32hex>-<span16hex>-<flags2hex>`.
#[derive(Debug, Clone)]
pub struct Traceparent {
    pub trace_id: TraceId,
    pub parent_span_id: SpanId,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceparentError {
    #[error("traceparent must have 4 dash-separated fields")]
    Malformed,
    #[error("unsupported traceparent version (only \"00\" is accepted)")]
    UnsupportedVersion,
    #[error("trace-id field must be 32 lowercase hex chars")]
    InvalidTraceId,
    #[error("parent-id field must be 16 lowercase hex chars")]
    InvalidSpanId,
    #[error("flags field must be 2 hex chars")]
    InvalidFlags,
}

impl Traceparent {
    /// §4.10: accept only version `00`; reject any other version or
    /// malformed field.
    pub fn parse(header: &str) -> Result<Self, TraceparentError> {
        let fields: Vec<&str> = header.trim().split('-').collect();
        if fields.len() != 4 {
            return Err(TraceparentError::Malformed);
        }
        if fields[0] != "00" {
            return Err(TraceparentError::UnsupportedVersion);
        }
        let trace_hex = fields[1].to_lowercase();
        if !TraceId::is_valid(&trace_hex) {
            return Err(TraceparentError::InvalidTraceId);
        }
        let span_hex = fields[2].to_lowercase();
        if !SpanId::is_valid(&span_hex) {
            return Err(TraceparentError::InvalidSpanId);
        }
        if fields[3].len() != 2 || !fields[3].bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TraceparentError::InvalidFlags);
        }
        let flags = u8::from_str_radix(&fields[3].to_lowercase(), 16)
            .map_err(|_| TraceparentError::InvalidFlags)?;

        Ok(Self {
            trace_id: TraceId::from_hex(trace_hex),
            parent_span_id: SpanId::from_hex(span_hex),
            flags,
        })
    }

    /// Renders with normalized (lowercase, 16-hex-truncated) ids.
    pub fn format(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id.as_str(),
            self.parent_span_id.truncated(),
            self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_header() {
        let tp = Traceparent::parse(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .unwrap();
        assert_eq!(tp.trace_id.as_str(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(tp.parent_span_id.as_str(), "00f067aa0ba902b7");
        assert_eq!(tp.flags, 1);
    }

    #[test]
    fn rejects_wrong_version() {
        let err = Traceparent::parse(
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .unwrap_err();
        assert_eq!(err, TraceparentError::UnsupportedVersion);
    }

    #[test]
    fn rejects_malformed_field_count() {
        assert_eq!(
            Traceparent::parse("00-deadbeef").unwrap_err(),
            TraceparentError::Malformed
        );
    }

    #[test]
    fn round_trip_normalizes_case() {
        let tp = Traceparent::parse(
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00F067AA0BA902B7-00",
        )
        .unwrap();
        assert_eq!(
            tp.format(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"
        );
    }
}
