//! Incremental decoder for the assistant event stream.
//!
//! Framing is newline-delimited JSON, optionally wrapped in SSE `data:` lines. Unit
//! boundaries carry no meaning: bytes are buffered until an event is complete, which
//! may be a newline or, for a bare JSON object, its closing brace.

use std::collections::VecDeque;

use futures::{Stream, StreamExt, stream};
use serde_json::{Map, Value};
use snafu::OptionExt;

use crate::error::{
    DecodeError, InvalidFieldsSnafu, InvalidUtf8Snafu, MalformedJsonSnafu,
    MissingDiscriminantSnafu, TransportError,
};
use crate::event::{CompletePayload, ContextualUpdate, StreamEvent};

const SSE_DATA_PREFIX: &str = "data:";
const SSE_IGNORED_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];
const DONE_SENTINEL: &str = "[DONE]";
const EXCERPT_LIMIT: usize = 96;
const UNKNOWN_STREAM_ERROR: &str = "unknown stream error";

pub type DecodeResult = Result<StreamEvent, DecodeError>;

/// Stateful decoder for one send operation. Not restartable.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw transport unit and returns every event it completed.
    pub fn push(&mut self, unit: &[u8]) -> Vec<DecodeResult> {
        self.buffer.extend_from_slice(unit);

        let mut decoded = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            decode_line(&line[..newline], &mut decoded);
        }
        self.drain_complete_objects(&mut decoded);

        decoded
    }

    /// Flushes whatever is still buffered once the transport has closed.
    pub fn finish(&mut self) -> Vec<DecodeResult> {
        let rest = std::mem::take(&mut self.buffer);
        let mut decoded = Vec::new();
        decode_line(&rest, &mut decoded);
        decoded
    }

    pub fn has_pending(&self) -> bool {
        self.buffer.iter().any(|byte| !byte.is_ascii_whitespace())
    }

    // Bare objects without a trailing newline are emitted as soon as they close.
    fn drain_complete_objects(&mut self, decoded: &mut Vec<DecodeResult>) {
        let start = self
            .buffer
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        if self.buffer.get(start) != Some(&b'{') {
            return;
        }

        let mut consumed = 0;
        {
            let mut values =
                serde_json::Deserializer::from_slice(&self.buffer[start..]).into_iter::<Value>();
            // Incomplete or malformed tails stay buffered until a newline or `finish`.
            while let Some(Ok(value)) = values.next() {
                consumed = start + values.byte_offset();
                if let Some(result) = classify(value) {
                    decoded.push(result);
                }
            }
        }
        self.buffer.drain(..consumed);
    }
}

fn decode_line(raw: &[u8], decoded: &mut Vec<DecodeResult>) {
    let Ok(text) = std::str::from_utf8(raw) else {
        decoded.push(
            InvalidUtf8Snafu {
                stage: "decode-line-utf8",
            }
            .fail(),
        );
        return;
    };

    let line = text.trim();
    if line.is_empty() || line.starts_with(':') {
        return;
    }

    let payload = if let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) {
        data.trim_start()
    } else if SSE_IGNORED_FIELDS
        .iter()
        .any(|field| line.starts_with(field))
    {
        return;
    } else {
        line
    };

    if payload.is_empty() || payload == DONE_SENTINEL {
        return;
    }

    for item in serde_json::Deserializer::from_str(payload).into_iter::<Value>() {
        match item {
            Ok(value) => {
                if let Some(result) = classify(value) {
                    decoded.push(result);
                }
            }
            Err(error) => {
                decoded.push(
                    MalformedJsonSnafu {
                        stage: "decode-line-json",
                        details: error.to_string(),
                        excerpt: excerpt(payload),
                    }
                    .fail(),
                );
                break;
            }
        }
    }
}

/// Maps one JSON value onto a stream event. `None` means an unknown kind to skip.
fn classify(value: Value) -> Option<DecodeResult> {
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Some(
                MissingDiscriminantSnafu {
                    stage: "classify-not-object",
                    excerpt: excerpt(&other.to_string()),
                }
                .fail(),
            );
        }
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => {
            return Some(
                MissingDiscriminantSnafu {
                    stage: "classify-discriminant",
                    excerpt: excerpt(&Value::Object(fields).to_string()),
                }
                .fail(),
            );
        }
    };

    let result = match kind.as_str() {
        "contextual" => classify_contextual(fields),
        "metadata" => Ok(StreamEvent::Metadata(flatten_metadata(fields))),
        "chunk" => take_string(&mut fields, "content")
            .context(InvalidFieldsSnafu {
                stage: "classify-chunk",
                kind: "chunk",
                details: "missing string `content`",
            })
            .map(StreamEvent::Chunk),
        "complete" => serde_json::from_value::<CompletePayload>(Value::Object(fields))
            .map(StreamEvent::Complete)
            .map_err(|error| DecodeError::InvalidFields {
                stage: "classify-complete",
                kind: "complete".to_string(),
                details: error.to_string(),
            }),
        "error" => Ok(StreamEvent::Error(
            take_string(&mut fields, "message")
                .or_else(|| take_string(&mut fields, "error"))
                .or_else(|| take_string(&mut fields, "content"))
                .unwrap_or_else(|| UNKNOWN_STREAM_ERROR.to_string()),
        )),
        other => {
            tracing::debug!(kind = other, "ignoring stream unit of unknown type");
            return None;
        }
    };

    Some(result)
}

fn classify_contextual(mut fields: Map<String, Value>) -> DecodeResult {
    let text = take_string(&mut fields, "content")
        .or_else(|| take_string(&mut fields, "text"))
        .context(InvalidFieldsSnafu {
            stage: "classify-contextual",
            kind: "contextual",
            details: "missing string `content`",
        })?;
    let stage = take_string(&mut fields, "stage");

    Ok(StreamEvent::Contextual(ContextualUpdate { text, stage }))
}

// Some backends nest early metadata under a `metadata` key; both shapes merge flat.
fn flatten_metadata(mut fields: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(nested)) = fields.remove("metadata") {
        fields.extend(nested);
    }
    fields
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

fn excerpt(raw: &str) -> String {
    raw.chars().take(EXCERPT_LIMIT).collect()
}

/// One item of a decoded transport stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(StreamEvent),
    Malformed(DecodeError),
    TransportFailed(TransportError),
}

impl From<DecodeResult> for Decoded {
    fn from(result: DecodeResult) -> Self {
        match result {
            Ok(event) => Self::Event(event),
            Err(error) => Self::Malformed(error),
        }
    }
}

struct DecodeState<S> {
    units: S,
    decoder: StreamDecoder,
    ready: VecDeque<Decoded>,
    finished: bool,
}

/// Lazily decodes a transport stream. Ends when the transport ends or fails.
pub fn decode_units<S>(units: S) -> impl Stream<Item = Decoded> + Send
where
    S: Stream<Item = Result<Vec<u8>, TransportError>> + Send + Unpin,
{
    let state = DecodeState {
        units,
        decoder: StreamDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.units.next().await {
                Some(Ok(unit)) => {
                    let decoded = state.decoder.push(&unit);
                    state.ready.extend(decoded.into_iter().map(Decoded::from));
                }
                Some(Err(error)) => {
                    state.finished = true;
                    state.ready.push_back(Decoded::TransportFailed(error));
                }
                None => {
                    state.finished = true;
                    if state.decoder.has_pending() {
                        tracing::debug!("flushing unterminated trailing unit");
                    }
                    let decoded = state.decoder.finish();
                    state.ready.extend(decoded.into_iter().map(Decoded::from));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn events(results: Vec<DecodeResult>) -> Vec<StreamEvent> {
        results
            .into_iter()
            .map(|result| result.expect("decoded event"))
            .collect()
    }

    #[test]
    fn decodes_newline_delimited_units() {
        let mut decoder = StreamDecoder::new();
        let decoded = events(decoder.push(
            b"{\"type\":\"contextual\",\"content\":\"thinking\",\"stage\":\"analyzing\"}\n{\"type\":\"chunk\",\"content\":\"Hi\"}\n",
        ));

        assert_eq!(
            decoded,
            vec![
                StreamEvent::Contextual(ContextualUpdate::new(
                    "thinking",
                    Some("analyzing".to_string())
                )),
                StreamEvent::Chunk("Hi".to_string()),
            ]
        );
        assert!(!decoder.has_pending());
    }

    #[test]
    fn reassembles_events_split_across_units_including_utf8_sequences() {
        let line = "data: {\"type\":\"chunk\",\"content\":\"caf\u{e9} \u{1f4aa}\"}\n".as_bytes();
        let mut decoder = StreamDecoder::new();
        let mut decoded = Vec::new();

        for piece in line.chunks(5) {
            decoded.extend(decoder.push(piece));
        }

        assert_eq!(
            events(decoded),
            vec![StreamEvent::Chunk("caf\u{e9} \u{1f4aa}".to_string())]
        );
    }

    #[test]
    fn emits_bare_objects_without_waiting_for_a_newline() {
        let mut decoder = StreamDecoder::new();

        assert!(decoder.push(b"{\"type\":\"chunk\",").is_empty());
        let decoded = events(decoder.push(b"\"content\":\"Hi\"}{\"type\":\"chunk\",\"content\":\" there\"}"));

        assert_eq!(
            decoded,
            vec![
                StreamEvent::Chunk("Hi".to_string()),
                StreamEvent::Chunk(" there".to_string()),
            ]
        );
        assert!(!decoder.has_pending());
    }

    #[test]
    fn skips_sse_framing_and_done_sentinel() {
        let mut decoder = StreamDecoder::new();
        let decoded = events(decoder.push(
            b": keep-alive\r\nevent: message\r\nid: 7\r\ndata: {\"type\":\"chunk\",\"content\":\"a\"}\r\n\r\ndata: [DONE]\r\n",
        ));

        assert_eq!(decoded, vec![StreamEvent::Chunk("a".to_string())]);
    }

    #[test]
    fn duplicate_fields_keep_the_last_value() {
        let mut decoder = StreamDecoder::new();
        let decoded = events(
            decoder.push(b"{\"type\":\"chunk\",\"content\":\"first\",\"content\":\"second\"}\n"),
        );

        assert_eq!(decoded, vec![StreamEvent::Chunk("second".to_string())]);
    }

    #[test]
    fn unknown_kinds_are_ignored_and_malformed_units_do_not_stop_decoding() {
        let mut decoder = StreamDecoder::new();
        let decoded = decoder.push(
            b"{\"type\":\"heartbeat\"}\n{not json}\n{\"content\":\"no type\"}\n{\"type\":\"chunk\"}\n{\"type\":\"chunk\",\"content\":\"ok\"}\n",
        );

        assert_eq!(decoded.len(), 4);
        assert!(matches!(decoded[0], Err(DecodeError::MalformedJson { .. })));
        assert!(matches!(
            decoded[1],
            Err(DecodeError::MissingDiscriminant { .. })
        ));
        assert!(matches!(decoded[2], Err(DecodeError::InvalidFields { .. })));
        assert_eq!(decoded[3], Ok(StreamEvent::Chunk("ok".to_string())));
    }

    #[test]
    fn metadata_and_error_units_are_classified() {
        let mut decoder = StreamDecoder::new();
        let decoded = events(decoder.push(
            b"{\"type\":\"metadata\",\"mode\":\"build\",\"metadata\":{\"badge\":\"plan\"}}\n{\"type\":\"error\",\"error\":\"rate limited\"}\n{\"type\":\"error\"}\n",
        ));

        let mut expected = Map::new();
        expected.insert("mode".to_string(), json!("build"));
        expected.insert("badge".to_string(), json!("plan"));
        assert_eq!(
            decoded,
            vec![
                StreamEvent::Metadata(expected),
                StreamEvent::Error("rate limited".to_string()),
                StreamEvent::Error(UNKNOWN_STREAM_ERROR.to_string()),
            ]
        );
    }

    #[test]
    fn finish_flushes_a_trailing_line_and_reports_truncated_json() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"chunk\",\"content\":\"tail\"}").is_empty());
        assert_eq!(
            events(decoder.finish()),
            vec![StreamEvent::Chunk("tail".to_string())]
        );

        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(b"{\"type\":\"chunk\",\"cont").is_empty());
        let flushed = decoder.finish();
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0], Err(DecodeError::MalformedJson { .. })));
    }

    #[tokio::test]
    async fn decode_units_surfaces_transport_failure_after_buffered_events() {
        let units = stream::iter(vec![
            Ok(b"{\"type\":\"chunk\",\"content\":\"Hi\"}\n".to_vec()),
            Err(TransportError::ReadStream {
                stage: "test",
                message: "connection reset".to_string(),
            }),
            Ok(b"{\"type\":\"chunk\",\"content\":\"never\"}\n".to_vec()),
        ]);

        let decoded = decode_units(units).collect::<Vec<_>>().await;

        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[0],
            Decoded::Event(StreamEvent::Chunk("Hi".to_string()))
        );
        assert!(matches!(decoded[1], Decoded::TransportFailed(_)));
    }

    #[tokio::test]
    async fn decode_units_flushes_an_unterminated_unit_when_the_stream_ends() {
        let units = stream::iter(vec![
            Ok::<_, TransportError>(b"data: {\"type\":\"chunk\",\"content\":\"ta".to_vec()),
            Ok(b"il\"}".to_vec()),
        ]);

        let decoded = decode_units(units).collect::<Vec<_>>().await;

        assert_eq!(
            decoded,
            vec![Decoded::Event(StreamEvent::Chunk("tail".to_string()))]
        );
    }
}
