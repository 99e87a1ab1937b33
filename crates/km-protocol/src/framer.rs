//! Line-oriented framer for the MCP stdio transport.
//!
//! One JSON object per newline-terminated line. The framer never decides
//! whether bytes get forwarded; it only reports what it saw so the proxy can
//! forward first and classify second.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::jsonrpc::FrameError;

/// Default maximum line length: 1 MiB.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// One line read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line within the size limit (newline stripped).
    Line(Vec<u8>),
    /// A line exceeding the configured limit. The bytes must still be
    /// forwarded, but no event may be derived from them.
    Oversized(Vec<u8>),
}

impl Frame {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Frame::Line(b) | Frame::Oversized(b) => b,
        }
    }
}

/// Buffered line reader with a length cap.
pub struct LineFramer<R> {
    reader: R,
    max_line_len: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_line_len(reader, DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(reader: R, max_line_len: usize) -> Self {
        Self {
            reader,
            max_line_len,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next non-empty line. Returns `None` at end of stream.
    ///
    /// Empty lines are skipped. Lines longer than the cap come back as
    /// [`Frame::Oversized`] together with a [`FrameError::LineTooLong`]
    /// diagnostic the caller is expected to log.
    pub async fn next_frame(
        &mut self,
    ) -> std::io::Result<Option<(Frame, Option<FrameError>)>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            }

            if self.buf.is_empty() {
                continue;
            }

            let bytes = self.buf.clone();
            if bytes.len() > self.max_line_len {
                let err = FrameError::LineTooLong {
                    len: bytes.len(),
                    limit: self.max_line_len,
                };
                return Ok(Some((Frame::Oversized(bytes), Some(err))));
            }

            return Ok(Some((Frame::Line(bytes), None)));
        }
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::JsonRpcEnvelope;
    use tokio::io::BufReader;

    async fn frames(input: &[u8], cap: usize) -> Vec<(Frame, Option<FrameError>)> {
        let mut framer = LineFramer::with_max_line_len(BufReader::new(input), cap);
        let mut out = Vec::new();
        while let Some(frame) = framer.next_frame().await.unwrap() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn reads_lines_and_skips_empty() {
        let input = b"{\"a\":1}\n\n\n{\"b\":2}\n";
        let got = frames(input, 1024).await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, Frame::Line(b"{\"a\":1}".to_vec()));
        assert_eq!(got[1].0, Frame::Line(b"{\"b\":2}".to_vec()));
    }

    #[tokio::test]
    async fn strips_crlf() {
        let got = frames(b"{\"a\":1}\r\n", 1024).await;
        assert_eq!(got[0].0, Frame::Line(b"{\"a\":1}".to_vec()));
    }

    #[tokio::test]
    async fn line_just_under_cap_is_a_frame() {
        let line = vec![b'x'; 16];
        let mut input = line.clone();
        input.push(b'\n');
        let got = frames(&input, 16).await;
        assert_eq!(got[0].0, Frame::Line(line));
        assert!(got[0].1.is_none());
    }

    #[tokio::test]
    async fn oversized_line_keeps_bytes_for_forwarding() {
        let line = vec![b'x'; 17];
        let mut input = line.clone();
        input.push(b'\n');
        let got = frames(&input, 16).await;
        match &got[0] {
            (Frame::Oversized(bytes), Some(FrameError::LineTooLong { len, limit })) => {
                assert_eq!(bytes, &line);
                assert_eq!(*len, 17);
                assert_eq!(*limit, 16);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unterminated_final_line_is_returned() {
        let got = frames(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}", 1024).await;
        assert_eq!(got.len(), 1);
        let env = JsonRpcEnvelope::classify(got[0].0.bytes()).unwrap();
        assert_eq!(env.method(), "ping");
    }
}
