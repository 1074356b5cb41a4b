use serde_json::{ json, Value as JsonValue };
use std::fmt;

/// One unit of a relayed chat stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    ThreadId(String),
    Chunk(String),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFrameShape(pub String);

impl fmt::Display for UnknownFrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload carries no frame fields: {}", self.0)
    }
}

impl std::error::Error for UnknownFrameShape {}

impl StreamFrame {
    /// Decomposes one `data:` JSON payload into frames. A payload may carry
    /// several keys at once; they come out as thread_id, chunk, done, error.
    pub fn from_payload(payload: &JsonValue) -> Result<Vec<StreamFrame>, UnknownFrameShape> {
        let obj = payload.as_object().ok_or_else(|| UnknownFrameShape(payload.to_string()))?;
        let mut frames = Vec::new();

        if let Some(id) = obj.get("thread_id").and_then(JsonValue::as_str) {
            if !id.is_empty() {
                frames.push(StreamFrame::ThreadId(id.to_string()));
            }
        }
        if let Some(chunk) = obj.get("chunk").and_then(JsonValue::as_str) {
            if !chunk.is_empty() {
                frames.push(StreamFrame::Chunk(chunk.to_string()));
            }
        }
        if obj.get("done").and_then(JsonValue::as_bool) == Some(true) {
            frames.push(StreamFrame::Done);
        }
        if let Some(err) = obj.get("error") {
            let text = match err {
                JsonValue::String(s) => s.clone(),
                JsonValue::Null => String::new(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                frames.push(StreamFrame::Error(text));
            }
        }

        let known = ["thread_id", "chunk", "done", "error"];
        if frames.is_empty() && !obj.keys().any(|k| known.contains(&k.as_str())) {
            return Err(UnknownFrameShape(payload.to_string()));
        }
        Ok(frames)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            StreamFrame::ThreadId(id) => json!({ "thread_id": id }),
            StreamFrame::Chunk(text) => json!({ "chunk": text }),
            StreamFrame::Done => json!({ "done": true }),
            StreamFrame::Error(message) => json!({ "error": message }),
        }
    }

    /// Wire form: a single SSE event.
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Done | StreamFrame::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_payload_keeps_canonical_order() {
        let frames = StreamFrame::from_payload(
            &json!({ "chunk": "Hi", "thread_id": "t1", "done": true })
        ).unwrap();
        assert_eq!(frames, vec![
            StreamFrame::ThreadId("t1".into()),
            StreamFrame::Chunk("Hi".into()),
            StreamFrame::Done
        ]);
    }

    #[test]
    fn empty_chunk_and_false_done_carry_nothing() {
        assert!(StreamFrame::from_payload(&json!({ "chunk": "" })).unwrap().is_empty());
        assert!(StreamFrame::from_payload(&json!({ "done": false })).unwrap().is_empty());
    }

    #[test]
    fn foreign_payloads_are_rejected() {
        assert!(StreamFrame::from_payload(&json!({ "choices": [] })).is_err());
        assert!(StreamFrame::from_payload(&json!("text")).is_err());
    }

    #[test]
    fn sse_wire_form() {
        assert_eq!(StreamFrame::Chunk("Hi".into()).to_sse(), "data: {\"chunk\":\"Hi\"}\n\n");
        assert_eq!(StreamFrame::Done.to_sse(), "data: {\"done\":true}\n\n");
    }
}
