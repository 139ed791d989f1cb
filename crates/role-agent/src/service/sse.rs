use std::io::BufRead;

use serde_json::Value;

use super::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server-sent-events reader.
///
/// Field lines are accumulated until a blank line dispatches the event. Multiple
/// `data:` lines are joined with `\n`; comment lines (leading `:`) are ignored;
/// an unterminated event at end of stream is still delivered.
pub struct SseReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> SseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    pub fn next_event(&mut self) -> Result<Option<SseEvent>, ServiceError> {
        let mut event: Option<String> = None;
        let mut data: Vec<String> = Vec::new();
        let mut seen_field = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| ServiceError::Stream(format!("read failed: {e}")))?;
            if n == 0 {
                if seen_field {
                    return Ok(Some(SseEvent {
                        event,
                        data: data.join("\n"),
                    }));
                }
                return Ok(None);
            }

            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if seen_field {
                    return Ok(Some(SseEvent {
                        event,
                        data: data.join("\n"),
                    }));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "data" => {
                    data.push(value.to_string());
                    seen_field = true;
                }
                "event" => {
                    event = Some(value.to_string());
                    seen_field = true;
                }
                // id / retry carry nothing this client needs.
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    Message {
        answer: String,
        message_id: Option<String>,
        task_id: Option<String>,
    },
    MessageEnd {
        message_id: Option<String>,
    },
    WorkflowStarted {
        task_id: Option<String>,
    },
    TextChunk {
        text: String,
    },
    WorkflowFinished {
        status: String,
        outputs: Value,
        error: Option<String>,
    },
    Error {
        message: String,
        status: Option<u16>,
    },
    Ping,
    Other(String),
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn decode_platform_event(data: &str) -> Result<PlatformEvent, ServiceError> {
    let v: Value = serde_json::from_str(data)
        .map_err(|e| ServiceError::Decode(format!("bad event payload: {e}")))?;
    let kind = str_field(&v, "event").unwrap_or_default();
    let ev = match kind.as_str() {
        "message" | "agent_message" => PlatformEvent::Message {
            answer: str_field(&v, "answer").unwrap_or_default(),
            message_id: str_field(&v, "message_id").or_else(|| str_field(&v, "id")),
            task_id: str_field(&v, "task_id"),
        },
        "message_end" => PlatformEvent::MessageEnd {
            message_id: str_field(&v, "message_id").or_else(|| str_field(&v, "id")),
        },
        "workflow_started" => PlatformEvent::WorkflowStarted {
            task_id: str_field(&v, "task_id"),
        },
        "text_chunk" => PlatformEvent::TextChunk {
            text: v
                .get("data")
                .and_then(|d| d.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "workflow_finished" => {
            let d = v.get("data").cloned().unwrap_or(Value::Null);
            PlatformEvent::WorkflowFinished {
                status: str_field(&d, "status").unwrap_or_default(),
                outputs: d.get("outputs").cloned().unwrap_or(Value::Null),
                error: str_field(&d, "error").filter(|e| !e.is_empty()),
            }
        }
        "error" => PlatformEvent::Error {
            message: str_field(&v, "message").unwrap_or_else(|| "unknown error".into()),
            status: v
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok()),
        },
        "ping" => PlatformEvent::Ping,
        other => PlatformEvent::Other(other.to_string()),
    };
    Ok(ev)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(raw: &str) -> Vec<SseEvent> {
        let mut r = SseReader::new(raw.as_bytes());
        let mut out = Vec::new();
        while let Some(ev) = r.next_event().unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn splits_on_blank_lines_and_skips_comments() {
        let raw = ": keep-alive\n\ndata: {\"a\":1}\n\nevent: ping\ndata: x\r\n\r\n";
        let evs = events(raw);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].data, "{\"a\":1}");
        assert_eq!(evs[0].event, None);
        assert_eq!(evs[1].event.as_deref(), Some("ping"));
        assert_eq!(evs[1].data, "x");
    }

    #[test]
    fn joins_multi_line_data_and_flushes_at_eof() {
        let evs = events("data: one\ndata: two");
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].data, "one\ntwo");
    }

    #[test]
    fn decodes_completion_events() {
        let ev = decode_platform_event(
            r#"{"event":"message","answer":"Hi","message_id":"m1","task_id":"t1"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            PlatformEvent::Message {
                answer: "Hi".into(),
                message_id: Some("m1".into()),
                task_id: Some("t1".into()),
            }
        );

        let ev = decode_platform_event(r#"{"event":"error","message":"quota","status":429}"#)
            .unwrap();
        assert_eq!(
            ev,
            PlatformEvent::Error {
                message: "quota".into(),
                status: Some(429),
            }
        );
    }

    #[test]
    fn decodes_workflow_events() {
        let ev = decode_platform_event(
            r#"{"event":"workflow_finished","data":{"status":"failed","outputs":null,"error":"boom"}}"#,
        )
        .unwrap();
        match ev {
            PlatformEvent::WorkflowFinished { status, error, .. } => {
                assert_eq!(status, "failed");
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let ev = decode_platform_event(r#"{"event":"node_started","data":{}}"#).unwrap();
        assert_eq!(ev, PlatformEvent::Other("node_started".into()));
    }
}
