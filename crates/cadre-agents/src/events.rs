use cadre_types::RawAgentEvent;

/// Incremental SSE frame parser. Consumes one complete `event` block from
/// the front of `buffer` (terminated by a blank line) and decodes its
/// `data:` payload into a raw agent event. Returns `None` until a full
/// frame is buffered.
pub fn parse_sse_event(buffer: &mut String) -> Option<RawAgentEvent> {
    loop {
        let boundary = find_frame_boundary(buffer)?;
        let frame: String = buffer.drain(..boundary.frame_end).collect();
        buffer.drain(..boundary.separator_len);

        let mut event_name: Option<String> = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
            // comment lines (":" prefix) and ids are keepalive noise
        }
        if data_lines.is_empty() {
            continue;
        }
        let data = data_lines.join("\n");
        match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(value) => {
                let method = value
                    .get("method")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or(event_name)
                    .unwrap_or_else(|| "event".to_string());
                let params = value
                    .get("params")
                    .cloned()
                    .unwrap_or_else(|| value.clone());
                return Some(RawAgentEvent { method, params });
            }
            Err(err) => {
                tracing::debug!(error = %err, "skipping undecodable SSE frame");
                continue;
            }
        }
    }
}

struct FrameBoundary {
    frame_end: usize,
    separator_len: usize,
}

fn find_frame_boundary(buffer: &str) -> Option<FrameBoundary> {
    let lf = buffer.find("\n\n").map(|i| FrameBoundary {
        frame_end: i,
        separator_len: 2,
    });
    let crlf = buffer.find("\r\n\r\n").map(|i| FrameBoundary {
        frame_end: i,
        separator_len: 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.frame_end <= b.frame_end { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_complete_frames_and_keeps_the_tail() {
        let mut buffer = String::from(
            "event: notification\ndata: {\"method\":\"turn/started\",\"params\":{\"turnId\":\"t1\"}}\n\nevent: partial\ndata: {\"met",
        );
        let event = parse_sse_event(&mut buffer).expect("first frame");
        assert_eq!(event.method, "turn/started");
        assert_eq!(event.params, json!({"turnId": "t1"}));
        assert!(parse_sse_event(&mut buffer).is_none());
        assert!(buffer.starts_with("event: partial"));
    }

    #[test]
    fn skips_keepalive_comments_and_empty_frames() {
        let mut buffer = String::from(": ping\n\ndata: {\"method\":\"error\",\"params\":{}}\n\n");
        let event = parse_sse_event(&mut buffer).expect("event after keepalive");
        assert_eq!(event.method, "error");
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut buffer =
            String::from("data: {\"method\":\"turn/completed\",\ndata: \"params\":{}}\n\n");
        let event = parse_sse_event(&mut buffer).expect("joined frame");
        assert_eq!(event.method, "turn/completed");
    }

    #[test]
    fn event_name_is_fallback_discriminator() {
        let mut buffer = String::from("event: ping\ndata: {\"ok\":true}\n\n");
        let event = parse_sse_event(&mut buffer).expect("frame");
        assert_eq!(event.method, "ping");
        assert_eq!(event.params, json!({"ok": true}));
    }
}
