/// Line Framer
/// Turns the worker's stdout byte stream into complete lines.

/// Default upper bound on a single line, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Splits a byte stream on `\n`, buffering the unterminated tail between
/// reads.
///
/// Lines are cut on raw bytes and decoded afterwards, so a UTF-8 character
/// split across two reads comes out whole. Invalid UTF-8 is replaced rather
/// than rejected. A line longer than the limit is dropped entirely and
/// framing resumes after its terminator.
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Bytes of an oversized line are being skipped until the next `\n`
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Feed one chunk, get back every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.len() + head.len() > self.max_line_bytes {
                log::warn!(
                    "[Framer] Dropping {} byte line (limit {})",
                    self.buf.len() + head.len(),
                    self.max_line_bytes
                );
                self.buf.clear();
                continue;
            }

            self.buf.extend_from_slice(head);
            if let Some(line) = decode_line(&self.buf) {
                lines.push(line);
            }
            self.buf.clear();
        }

        if !self.discarding && !rest.is_empty() {
            if self.buf.len() + rest.len() > self.max_line_bytes {
                log::warn!(
                    "[Framer] Line exceeds {} bytes, skipping to next newline",
                    self.max_line_bytes
                );
                self.buf.clear();
                self.discarding = true;
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        lines
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Close the stream. An unterminated tail is not a message; it is logged
    /// and dropped. Returns how many bytes were dropped.
    pub fn finish(self) -> usize {
        let dropped = self.buf.len();
        if dropped > 0 {
            log::debug!(
                "[Framer] Stream closed with {} unterminated bytes, discarding: {:?}",
                dropped,
                String::from_utf8_lossy(&self.buf)
            );
        }
        dropped
    }
}

/// One raw line without its `\n`: drop a trailing `\r`, skip it if empty,
/// decode lossily.
pub(crate) fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(raw).into_owned())
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut framer = LineFramer::default();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(framer.push(chunk));
        }
        framer.finish();
        out
    }

    #[test]
    fn any_split_yields_same_lines() {
        let input = b"A\nB\nC\n";
        for i in 0..=input.len() {
            for j in i..=input.len() {
                let got = frame_all(&[&input[..i], &input[i..j], &input[j..]]);
                assert_eq!(got, vec!["A", "B", "C"], "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn byte_at_a_time() {
        let input = b"{\"status\":\"success\",\"message\":\"pong\"}\n{\"apps\":[]}\n";
        let chunks: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(
            frame_all(&chunks),
            vec![
                "{\"status\":\"success\",\"message\":\"pong\"}",
                "{\"apps\":[]}"
            ]
        );
    }

    #[test]
    fn unterminated_tail_is_dropped_on_close() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push(b"A\nB"), vec!["A"]);
        assert_eq!(framer.pending(), 1);
        assert_eq!(framer.finish(), 1);
    }

    #[test]
    fn partial_line_waits_for_terminator() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"{\"type\":").is_empty());
        assert!(framer.push(b"\"pong\"").is_empty());
        assert_eq!(framer.push(b"}\n"), vec!["{\"type\":\"pong\"}"]);
        assert_eq!(framer.finish(), 0);
    }

    #[test]
    fn crlf_and_blank_lines() {
        assert_eq!(
            frame_all(&[b"one\r\n\r\n\ntwo\r", b"\n"]),
            vec!["one", "two"]
        );
    }

    #[test]
    fn diagnostic_prefix_is_just_a_line() {
        assert_eq!(
            frame_all(&[b"Loading winget... {\"status\":\"ok\"}\n"]),
            vec!["Loading winget... {\"status\":\"ok\"}"]
        );
    }

    #[test]
    fn multibyte_char_split_across_reads() {
        let input = "caf\u{e9} \u{2713}\n".as_bytes();
        let (a, b) = input.split_at(4);
        assert_eq!(frame_all(&[a, b]), vec!["caf\u{e9} \u{2713}"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(frame_all(&[b"ok\xff\n"]), vec!["ok\u{fffd}"]);
    }

    #[test]
    fn oversized_line_in_one_chunk_is_dropped() {
        let mut framer = LineFramer::new(4);
        assert_eq!(framer.push(b"ok\ntoolong\nfine\n"), vec!["ok", "fine"]);
    }

    #[test]
    fn oversized_line_across_chunks_is_dropped() {
        let mut framer = LineFramer::new(4);
        assert_eq!(framer.push(b"ab"), Vec::<String>::new());
        assert!(framer.push(b"cdef").is_empty());
        assert!(framer.push(b"ghij").is_empty());
        assert_eq!(framer.push(b"kl\nnext\n"), vec!["next"]);
        assert_eq!(framer.finish(), 0);
    }

    #[test]
    fn limit_is_inclusive() {
        let mut framer = LineFramer::new(4);
        assert_eq!(framer.push(b"abcd\n"), vec!["abcd"]);
    }
}
