//! Newline-delimited JSON decoding for streaming generations.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use modsage_abstraction::{ErrorKind, ModelUsage, ServerError, StreamChunk};
use serde::Deserialize;
use tracing::debug;

/// One `/api/generate` record, shared by the blocking and streaming paths.
#[derive(Debug, Deserialize)]
pub(crate) struct GenerateRecord {
    #[serde(default)]
    pub(crate) model: String,
    #[serde(default)]
    pub(crate) response: String,
    #[serde(default)]
    pub(crate) done: bool,
    pub(crate) prompt_eval_count: Option<u32>,
    pub(crate) eval_count: Option<u32>,
    pub(crate) total_duration: Option<u64>,
    pub(crate) load_duration: Option<u64>,
    pub(crate) error: Option<String>,
}

impl GenerateRecord {
    /// Usage is only meaningful once the server has reported either count.
    pub(crate) fn usage(&self) -> Option<ModelUsage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        Some(ModelUsage::new(self.prompt_eval_count.unwrap_or(0), self.eval_count.unwrap_or(0)))
    }
}

/// Splits a byte stream into NDJSON records and decodes each one.
///
/// Records may straddle network chunks; bytes are buffered until a newline
/// arrives so multi-byte characters split across chunks decode correctly.
/// The stream ends after the terminal (`done: true`) record.
pub struct NdjsonStream<S> {
    inner: S,
    buffer: Vec<u8>,
    inner_done: bool,
    terminated: bool,
}

impl<S> NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, ServerError>> + Unpin,
{
    /// Wraps a byte stream.
    pub fn new(inner: S) -> Self {
        Self { inner, buffer: Vec::new(), inner_done: false, terminated: false }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        Some(line)
    }

    fn decode(&mut self, line: &[u8]) -> Result<StreamChunk, ServerError> {
        let record: GenerateRecord = serde_json::from_slice(line).map_err(|e| {
            ServerError::new(ErrorKind::Decode, format!("Failed to parse stream record: {e}"))
        })?;

        if let Some(message) = record.error {
            self.terminated = true;
            return Err(ServerError::new(ErrorKind::Http, message));
        }

        if record.done {
            self.terminated = true;
        }

        Ok(StreamChunk { usage: record.usage(), text: record.response, done: record.done })
    }
}

impl<S> Stream for NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, ServerError>> + Unpin,
{
    type Item = Result<StreamChunk, ServerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.terminated {
                return Poll::Ready(None);
            }

            if let Some(line) = self.take_line() {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Poll::Ready(Some(self.decode(&line)));
            }

            if self.inner_done {
                self.terminated = true;
                let rest = std::mem::take(&mut self.buffer);
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(self.decode(&rest)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    debug!(buffered = self.buffer.len(), "Stream body ended");
                    self.inner_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::stream;

    fn bytes_stream(
        parts: Vec<Result<&'static str, ServerError>>,
    ) -> impl Stream<Item = Result<Bytes, ServerError>> + Unpin {
        stream::iter(parts.into_iter().map(|p| p.map(Bytes::from)))
    }

    #[tokio::test]
    async fn test_records_split_across_chunks() {
        let body = bytes_stream(vec![
            Ok("{\"response\":\"Hel\",\"done\":false}\n{\"resp"),
            Ok("onse\":\"lo\",\"done\":false}\n"),
            Ok("{\"response\":\"\",\"done\":true,\"eval_count\":7,\"prompt_eval_count\":3}\n"),
        ]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 3);

        let texts: Vec<String> =
            chunks.iter().map(|c| c.as_ref().unwrap().text.clone()).collect();
        assert_eq!(texts, vec!["Hel", "lo", ""]);

        let last = chunks[2].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.usage, Some(ModelUsage::new(3, 7)));
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        let record = "{\"response\":\"caf\u{e9}\",\"done\":true}\n".as_bytes();
        let split = record.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let first = Bytes::copy_from_slice(&record[..split]);
        let second = Bytes::copy_from_slice(&record[split..]);
        let body = stream::iter(vec![Ok::<_, ServerError>(first), Ok(second)]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().text, "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_stream_stops_after_terminal_record() {
        let body = bytes_stream(vec![Ok(
            "{\"response\":\"a\",\"done\":true}\n{\"response\":\"ignored\",\"done\":false}\n",
        )]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_trailing_record_without_newline() {
        let body = bytes_stream(vec![Ok("{\"response\":\"tail\",\"done\":true}")]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().text, "tail");
    }

    #[tokio::test]
    async fn test_malformed_record_is_decode_error() {
        let body = bytes_stream(vec![Ok("not json\n")]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        let err = chunks[0].as_ref().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_error_record_terminates_stream() {
        let body = bytes_stream(vec![Ok(
            "{\"response\":\"x\",\"done\":false}\n{\"error\":\"model crashed\"}\n{\"response\":\"y\"}\n",
        )]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].as_ref().unwrap_err().message, "model crashed");
    }

    #[tokio::test]
    async fn test_transport_error_is_forwarded() {
        let body = bytes_stream(vec![
            Ok("{\"response\":\"x\",\"done\":false}\n"),
            Err(ServerError::new(ErrorKind::Network, "connection reset")),
            Ok("{\"response\":\"y\",\"done\":true}\n"),
        ]);

        let chunks: Vec<_> = NdjsonStream::new(body).collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].as_ref().unwrap_err().kind, ErrorKind::Network);
        assert_eq!(chunks[2].as_ref().unwrap().text, "y");
    }
}
