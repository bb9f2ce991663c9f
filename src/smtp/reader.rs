//! Splitting inbound bytes into CRLF-terminated command lines

const CRLF: &[u8] = b"\r\n";

/// Buffers raw bytes from the client and yields complete command lines.
///
/// Bytes after the last CRLF stay buffered until a later [`push`](Self::push) completes the line.
/// No length limit is applied here; callers check [`pending_len`](Self::pending_len).
#[derive(Debug, Default)]
pub struct LineReader {
    pending: Vec<u8>,
    /// Offset up to which `pending` has already been searched for a CRLF
    scanned: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the next complete line, CRLF stripped.
    ///
    /// Invalid UTF-8 is replaced rather than rejected so that the parser can answer it.
    pub fn next_line(&mut self) -> Option<String> {
        // A CR at the very end of the previous scan may pair with a LF that just arrived.
        let start = self.scanned.saturating_sub(1);
        match self.pending[start..]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
        {
            Some(offset) => {
                let end = start + offset;
                let line = String::from_utf8_lossy(&self.pending[..end]).into_owned();
                self.pending.drain(..end + CRLF.len());
                self.scanned = 0;
                Some(line)
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// Iterate over every line that is complete right now
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { reader: self }
    }

    /// Bytes received but not yet part of a complete line
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand over whatever is buffered, leaving the reader empty.
    ///
    /// Used when the session switches to body collection, where the bytes belong to the
    /// message instead of the next command.
    pub fn take_pending(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.pending)
    }
}

/// Lazy sequence of complete lines, see [`LineReader::lines`]
pub struct Lines<'a> {
    reader: &'a mut LineReader,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut reader = LineReader::new();
        reader.push(b"HELO client.local\r\n");

        assert_eq!(reader.next_line(), Some("HELO client.local".to_string()));
        assert_eq!(reader.next_line(), None);
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut reader = LineReader::new();
        reader.push(b"HELO a\r\nNOOP\r\nQUIT\r\n");

        let lines: Vec<String> = reader.lines().collect();
        assert_eq!(lines, vec!["HELO a", "NOOP", "QUIT"]);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut reader = LineReader::new();
        reader.push(b"MAIL FROM:<a@x");
        assert_eq!(reader.next_line(), None);
        assert_eq!(reader.pending_len(), 14);

        reader.push(b".com>\r\nRC");
        assert_eq!(reader.next_line(), Some("MAIL FROM:<a@x.com>".to_string()));
        assert_eq!(reader.next_line(), None);
        assert_eq!(reader.pending_len(), 2);
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut reader = LineReader::new();
        reader.push(b"NOOP\r");
        assert_eq!(reader.next_line(), None);

        reader.push(b"\n");
        assert_eq!(reader.next_line(), Some("NOOP".to_string()));
    }

    #[test]
    fn test_bare_lf_does_not_end_a_line() {
        let mut reader = LineReader::new();
        reader.push(b"NOOP\nQUIT\r\n");

        assert_eq!(reader.next_line(), Some("NOOP\nQUIT".to_string()));
    }

    #[test]
    fn test_empty_line() {
        let mut reader = LineReader::new();
        reader.push(b"\r\n");

        assert_eq!(reader.next_line(), Some(String::new()));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut reader = LineReader::new();
        reader.push(&[0xFF, b'A', b'\r', b'\n']);

        assert_eq!(reader.next_line(), Some("\u{FFFD}A".to_string()));
    }

    #[test]
    fn test_take_pending_after_data() {
        let mut reader = LineReader::new();
        reader.push(b"DATA\r\nSubject: hi\r\n");

        assert_eq!(reader.next_line(), Some("DATA".to_string()));
        assert_eq!(reader.take_pending(), b"Subject: hi\r\n".to_vec());
        assert_eq!(reader.pending_len(), 0);
        assert_eq!(reader.next_line(), None);
    }
}
