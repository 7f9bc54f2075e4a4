use serde_json::Value;

/// One server-sent-event chunk.
///
/// The wire rendering is fixed: `event: <type>\n[id: <id>\n]data: <json>\n\n`.
/// Clients resume with the `id` line, so its format must stay stable across
/// releases (`{run_id}_event_{seq}`).
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub id: Option<String>,
    pub data: Value,
}

impl SseMessage {
    pub fn new(event: impl Into<String>, id: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            id,
            data,
        }
    }

    /// Render the chunk exactly as it goes on the wire.
    pub fn format(&self) -> String {
        let mut out = format!("event: {}\n", self.event);
        if let Some(id) = &self.id {
            out.push_str(&format!("id: {}\n", id));
        }
        out.push_str(&format!("data: {}\n\n", self.data));
        out
    }

    /// Parse a single chunk produced by [`SseMessage::format`].
    pub fn parse(raw: &str) -> Option<Self> {
        let mut event = None;
        let mut id = None;
        let mut data = None;

        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                event = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("id: ") {
                id = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data = serde_json::from_str(rest).ok();
            }
        }

        Some(Self {
            event: event?,
            id,
            data: data?,
        })
    }
}

/// Event ids embed the per-run sequence number: `{run_id}_event_{seq}`.
pub fn event_id(run_id: &str, seq: i64) -> String {
    format!("{}_event_{}", run_id, seq)
}

/// Extract the sequence number from an event id, `None` when malformed.
pub fn extract_event_sequence(id: &str) -> Option<i64> {
    id.rsplit_once("_event_")?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn format_is_bit_exact() {
        let msg = SseMessage::new("values", Some("run-1_event_0".to_string()), json!({"k":1}));
        assert_eq!(
            msg.format(),
            "event: values\nid: run-1_event_0\ndata: {\"k\":1}\n\n"
        );

        let without_id = SseMessage::new("end", None, json!({"status":"success"}));
        assert_eq!(
            without_id.format(),
            "event: end\ndata: {\"status\":\"success\"}\n\n"
        );
    }

    #[test]
    fn wire_round_trip() {
        let msg = SseMessage::new("values", Some("r_event_3".to_string()), json!({"k": 1}));
        let parsed = SseMessage::parse(&msg.format()).unwrap();
        assert_eq!(parsed.event, "values");
        assert_eq!(parsed.data, json!({"k": 1}));
        assert_eq!(parsed, msg);
    }

    #[test]
    fn event_id_round_trip() {
        let id = event_id("abc", 42);
        assert_eq!(id, "abc_event_42");
        assert_eq!(extract_event_sequence(&id), Some(42));
    }

    #[test]
    fn extract_sequence_edge_cases() {
        assert_eq!(extract_event_sequence("run_123_event_42"), Some(42));
        assert_eq!(extract_event_sequence("simple_event_0"), Some(0));
        assert_eq!(extract_event_sequence("broken_format"), None);
        assert_eq!(extract_event_sequence("run_event_"), None);
        assert_eq!(extract_event_sequence("run_event_x"), None);
    }
}
