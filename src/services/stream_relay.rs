//! Incremental decoder for newline-delimited `data: {json}` streams

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::models::{RelayOutcome, StreamEvent, StreamRecord, TerminalPayload};

const DATA_PREFIX: &str = "data: ";

/// Single-pass decoder. Feed it raw chunks in arrival order; the decoded
/// events do not depend on where chunk boundaries fall.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    text: String,
    terminal: Option<TerminalPayload>,
    done: bool,
    malformed: usize,
}

/// Accumulated state once the input has ended
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub text: String,
    pub terminal: Option<TerminalPayload>,
    pub done: bool,
    pub malformed: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return the events completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
            start = end + 1;
            self.decode_line(&line, &mut events);
            if self.done {
                break;
            }
        }
        self.pending.drain(..start);
        if self.done {
            self.pending.clear();
        }
        events
    }

    /// Decode a trailing fragment that never got its newline
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        if self.done || self.pending.is_empty() {
            self.pending.clear();
            return Vec::new();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        let mut events = Vec::new();
        self.decode_line(&line, &mut events);
        events
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Flush and hand back everything decoded so far
    pub fn finish(mut self) -> Decoded {
        self.flush();
        self.into_decoded()
    }

    fn into_decoded(self) -> Decoded {
        Decoded {
            text: self.text,
            terminal: self.terminal,
            done: self.done,
            malformed: self.malformed,
        }
    }

    /// A record's delta is appended before its `done` flag is honoured, so
    /// text carried by the terminal record is kept.
    fn decode_line(&mut self, raw: &str, events: &mut Vec<StreamEvent>) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };

        let record: StreamRecord = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                self.malformed += 1;
                log::debug!("Skipping malformed stream record: {}", e);
                return;
            }
        };

        if let Some(delta) = record.delta.as_deref().filter(|d| !d.is_empty()) {
            self.text.push_str(delta);
            events.push(StreamEvent::Delta(delta.to_string()));
        }
        if record.done {
            self.done = true;
            let payload = record.terminal_payload();
            self.terminal = payload.clone();
            events.push(StreamEvent::Done(payload));
        }
    }
}

/// Drain a byte stream, calling `on_delta` for every text fragment as it
/// is decoded
pub async fn drain_stream<S, E, F>(stream: S, mut on_delta: F) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(&str),
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = StreamDecoder::new();
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                let decoded = decoder.into_decoded();
                return RelayOutcome::Incomplete {
                    text: decoded.text,
                    error: format!("Stream interrupted: {}", e),
                    malformed: decoded.malformed,
                };
            }
        };
        for event in decoder.push(&bytes) {
            if let StreamEvent::Delta(delta) = event {
                on_delta(&delta);
            }
        }
        if decoder.is_done() {
            break;
        }
    }

    for event in decoder.flush() {
        if let StreamEvent::Delta(delta) = event {
            on_delta(&delta);
        }
    }
    let decoded = decoder.finish();
    if decoded.done {
        RelayOutcome::Complete {
            text: decoded.text,
            terminal: decoded.terminal,
            malformed: decoded.malformed,
        }
    } else {
        RelayOutcome::Incomplete {
            text: decoded.text,
            error: "Stream ended before completion".to_string(),
            malformed: decoded.malformed,
        }
    }
}

/// Drain an HTTP response. A non-2xx status is reported with the server's
/// `{error}` text when it sent one.
pub async fn drain_response<F>(response: reqwest::Response, on_delta: F) -> RelayOutcome
where
    F: FnMut(&str),
{
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return RelayOutcome::Rejected {
            status: status.as_u16(),
            error: error_text(&body).unwrap_or_else(|| format!("HTTP {}", status)),
        };
    }
    drain_stream(response.bytes_stream(), on_delta).await
}

fn error_text(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("error")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BuildResult;

    fn sample() -> String {
        let mut out = String::new();
        out.push_str(&StreamRecord::delta("Compiling ").to_line());
        out.push_str(": keepalive\n");
        out.push_str(&StreamRecord::delta("héllo wörld\n").to_line());
        out.push_str(&StreamRecord::done_with_result(BuildResult {
            success: true,
            path: Some("artifacts/x/firmware.bin".to_string()),
            ..Default::default()
        })
        .to_line());
        out
    }

    fn decode_in_chunks(input: &[u8], size: usize) -> (Vec<StreamEvent>, Decoded) {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in input.chunks(size) {
            events.extend(decoder.push(chunk));
        }
        events.extend(decoder.flush());
        (events, decoder.finish())
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_result() {
        let input = sample();
        let (reference_events, reference) = decode_in_chunks(input.as_bytes(), input.len());
        assert!(reference.done);
        assert_eq!(reference.text, "Compiling héllo wörld\n");

        for size in 1..input.len() {
            let (events, decoded) = decode_in_chunks(input.as_bytes(), size);
            assert_eq!(decoded, reference, "chunk size {}", size);
            assert_eq!(events, reference_events, "chunk size {}", size);
        }
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let input = "data: {\"delta\":\"a\"}\ndata: {not json\ndata: {\"delta\":\"b\"}\r\n";
        let decoded = decode_in_chunks(input.as_bytes(), 7).1;
        assert_eq!(decoded.text, "ab");
        assert_eq!(decoded.malformed, 1);
        assert!(!decoded.done);
    }

    #[test]
    fn test_records_after_done_are_ignored() {
        let input = "data: {\"done\":true,\"items\":[1]}\ndata: {\"delta\":\"late\"}\n";
        let (events, decoded) = decode_in_chunks(input.as_bytes(), 5);
        assert_eq!(events.len(), 1);
        assert_eq!(decoded.text, "");
        let terminal = decoded.terminal.unwrap();
        assert_eq!(terminal.items, Some(serde_json::json!([1])));
    }

    #[test]
    fn test_text_on_terminal_record_is_kept() {
        let mut decoder = StreamDecoder::new();
        let first = decoder.push(b"data: {\"delta\":\"Hello \"}\n");
        let last = decoder.push(b"data: {\"delta\":\"world\",\"done\":true,\"items\":[1]}\n");
        assert_eq!(first, vec![StreamEvent::Delta("Hello ".to_string())]);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0], StreamEvent::Delta("world".to_string()));
        assert!(matches!(last[1], StreamEvent::Done(_)));

        let decoded = decoder.finish();
        assert!(decoded.done);
        assert_eq!(decoded.text, "Hello world");
        assert_eq!(decoded.terminal.unwrap().items, Some(serde_json::json!([1])));
    }

    #[test]
    fn test_unterminated_final_record_is_flushed() {
        let decoded = decode_in_chunks(b"data: {\"delta\":\"x\"}\ndata: {\"done\":true}", 4).1;
        assert_eq!(decoded.text, "x");
        assert!(decoded.done);
        assert_eq!(decoded.terminal, None);
    }

    #[tokio::test]
    async fn test_drain_reports_interruption_with_partial_text() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"delta\":\"par\"}\n")),
            Ok(Bytes::from_static(b"data: {\"delta\":\"tial\"}\n")),
            Err("connection reset".to_string()),
        ];
        let mut seen = Vec::new();
        let outcome = drain_stream(futures_util::stream::iter(chunks), |d| seen.push(d.to_string())).await;
        assert_eq!(seen, vec!["par", "tial"]);
        match outcome {
            RelayOutcome::Incomplete { text, error, .. } => {
                assert_eq!(text, "partial");
                assert!(error.contains("connection reset"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_without_done_is_incomplete() {
        let chunks: Vec<Result<Bytes, String>> = vec![Ok(Bytes::from_static(b"data: {\"delta\":\"x\"}\n"))];
        let outcome = drain_stream(futures_util::stream::iter(chunks), |_| {}).await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.text(), "x");
    }

    #[test]
    fn test_error_text_from_json_body() {
        assert_eq!(error_text("{\"error\":\"bad env\"}").as_deref(), Some("bad env"));
        assert_eq!(error_text("<html>"), None);
    }
}
