//! Stdout framing for replies.
//!
//! Plain mode writes one [`ChatOutput`] JSON object.  Stream mode writes one
//! server-sent event per reply chunk (`data: "<json string>"`), then an
//! `event: metadata` frame carrying memories, recalled turns and history.
//! Failures always produce `{"error": "..."}`; in stream mode an
//! `event: error` frame also closes stdout.

use std::io::{self, Write};

use persona_types::{ChatError, ChatOutput, Turn};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct Metadata<'a> {
    memories: &'a str,
    relevant_memories: &'a [String],
    history: &'a [Turn],
}

/// One reply chunk as an SSE `data:` frame.
pub fn write_delta(w: &mut impl Write, chunk: &str) -> io::Result<()> {
    writeln!(w, "data: {}\n", serde_json::to_string(chunk)?)?;
    w.flush()
}

/// The trailing `event: metadata` frame of a streamed reply.
pub fn write_metadata(w: &mut impl Write, output: &ChatOutput) -> io::Result<()> {
    let metadata = Metadata {
        memories: &output.memories,
        relevant_memories: &output.relevant_memories,
        history: &output.history,
    };
    writeln!(w, "event: metadata\ndata: {}\n", serde_json::to_string(&metadata)?)?;
    w.flush()
}

/// The whole reply as one JSON object.
pub fn write_output(w: &mut impl Write, output: &ChatOutput) -> io::Result<()> {
    serde_json::to_writer(&mut *w, output)?;
    writeln!(w)?;
    w.flush()
}

/// `{"error": "..."}` for `err`.
pub fn error_payload(err: &ChatError) -> serde_json::Value {
    json!({ "error": err.to_string() })
}

/// The `event: error` frame that ends a failed stream.
pub fn write_error_event(w: &mut impl Write, err: &ChatError) -> io::Result<()> {
    writeln!(w, "event: error\ndata: {}\n", error_payload(err))?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_types::{ConversationKey, Sender};

    fn output() -> ChatOutput {
        ChatOutput {
            response: "Hello".into(),
            memories: "*No memories formed yet.*".into(),
            relevant_memories: vec![],
            history: vec![Turn::new(ConversationKey::new("u1", "c1"), Sender::Agent, "Hello")],
        }
    }

    #[test]
    fn delta_is_json_string_frame() {
        let mut buf = Vec::new();
        write_delta(&mut buf, "say \"hi\"\n").unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "data: \"say \\\"hi\\\"\\n\"\n\n");
    }

    #[test]
    fn metadata_frame_omits_response() {
        let mut buf = Vec::new();
        write_metadata(&mut buf, &output()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let data = text
            .strip_prefix("event: metadata\ndata: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        assert!(value.get("response").is_none());
        assert_eq!(value["relevant_memories"], json!([]));
        assert_eq!(value["history"][0]["sender"], "agent");
    }

    #[test]
    fn plain_output_is_one_line_of_json() {
        let mut buf = Vec::new();
        write_output(&mut buf, &output()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["response"], "Hello");
        assert_eq!(value["history"][0]["message"], "Hello");
    }

    #[test]
    fn error_frame_carries_message() {
        let err = ChatError::AllBackendsExhausted {
            attempted: vec!["a".into()],
        };
        let mut buf = Vec::new();
        write_error_event(&mut buf, &err).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("event: error\ndata: {\"error\":"));
        assert!(text.contains("tried: a"));
        assert_eq!(error_payload(&err)["error"], err.to_string());
    }
}
