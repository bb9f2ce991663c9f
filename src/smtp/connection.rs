//! Drives one SMTP session over a duplex byte stream

use std::io::{ErrorKind, Read, Write};

use tracing::{debug, trace, warn};

use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::reader::LineReader;
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;
use crate::smtp::shutdown::Shutdown;

/// Size of a single read from the client
const READ_BUFFER_SIZE: usize = 4096;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent QUIT
    Quit,
    /// The client closed its side of the connection
    ClientDisconnected,
    /// No bytes arrived within the read timeout
    TimedOut,
    /// A recipient was unknown and the server is configured to hang up
    RecipientRejected,
    /// A fatal error was answered and the session dropped
    Failed,
    /// The server is shutting down
    Aborted,
}

/// Indicates if and why the session should end after handling some input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShouldClose {
    Keep,
    Close(CloseReason),
}

/// Run a session on `stream` until it ends.
///
/// Sends the greeting, then alternates between reading and answering. Command bytes go
/// through a [`LineReader`]; once DATA is accepted, bytes go to the session's framer
/// instead, starting with anything the client pipelined behind the DATA line.
///
/// # Errors
///
/// Only transport failures are returned. Protocol failures are answered on the stream and
/// reported as a [`CloseReason`].
pub fn handle<S: Read + Write>(
    stream: &mut S,
    handler: &SmtpCommandHandler<'_>,
    shutdown: &Shutdown,
) -> Result<CloseReason, SmtpError> {
    let mut session = SmtpSession::new();
    let mut reader = LineReader::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    send_response(stream, &SmtpResponse::greeting(&handler.config().hostname))?;

    loop {
        if shutdown.is_triggered() {
            session.close();
            return Ok(CloseReason::Aborted);
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => {
                if session.in_data_mode() {
                    debug!("client went away in the middle of a message");
                }
                session.close();
                if shutdown.is_triggered() {
                    return Ok(CloseReason::Aborted);
                }
                return Ok(CloseReason::ClientDisconnected);
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                session.close();
                reply_best_effort(stream, &SmtpResponse::timeout(&handler.config().hostname));
                return Ok(CloseReason::TimedOut);
            }
            Err(e) => {
                session.close();
                if shutdown.is_triggered() {
                    return Ok(CloseReason::Aborted);
                }
                return Err(e.into());
            }
        };
        trace!(bytes = n, data_mode = session.in_data_mode(), "read");

        if let ShouldClose::Close(reason) =
            process_chunk(stream, handler, &mut session, &mut reader, &buf[..n])?
        {
            return Ok(reason);
        }
    }
}

/// Route freshly read bytes to the line reader or the framer
fn process_chunk<S: Write>(
    stream: &mut S,
    handler: &SmtpCommandHandler<'_>,
    session: &mut SmtpSession,
    reader: &mut LineReader,
    chunk: &[u8],
) -> Result<ShouldClose, SmtpError> {
    if session.in_data_mode() {
        return process_body(stream, handler, session, chunk);
    }

    reader.push(chunk);
    while let Some(line) = reader.next_line() {
        if let ShouldClose::Close(reason) = process_line(stream, handler, session, &line)? {
            return Ok(ShouldClose::Close(reason));
        }

        if session.in_data_mode() {
            let pipelined = reader.take_pending();
            if pipelined.is_empty() {
                return Ok(ShouldClose::Keep);
            }
            return process_body(stream, handler, session, &pipelined);
        }
    }

    // The line can no longer be resynchronised once it outgrows the limit.
    if reader.pending_len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
        let err = SmtpError::LineTooLong {
            max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
        };
        return Ok(fail(stream, session, &err));
    }

    Ok(ShouldClose::Keep)
}

fn process_line<S: Write>(
    stream: &mut S,
    handler: &SmtpCommandHandler<'_>,
    session: &mut SmtpSession,
    line: &str,
) -> Result<ShouldClose, SmtpError> {
    match handler.process_command(line, session) {
        Ok(response) => {
            send_response(stream, &response)?;
            if session.is_closed() {
                return Ok(ShouldClose::Close(CloseReason::Quit));
            }
        }
        Err(e) if e.is_fatal() => return Ok(fail(stream, session, &e)),
        Err(e) => {
            debug!(error = %e, "command rejected");
            send_response(stream, &SmtpResponse::from(&e))?;
            if session.is_closed() {
                return Ok(ShouldClose::Close(CloseReason::RecipientRejected));
            }
        }
    }

    Ok(ShouldClose::Keep)
}

fn process_body<S: Write>(
    stream: &mut S,
    handler: &SmtpCommandHandler<'_>,
    session: &mut SmtpSession,
    chunk: &[u8],
) -> Result<ShouldClose, SmtpError> {
    match handler.process_data(chunk, session) {
        Ok(Some(response)) => {
            send_response(stream, &response)?;
            Ok(ShouldClose::Keep)
        }
        Ok(None) => Ok(ShouldClose::Keep),
        Err(e) => Ok(fail(stream, session, &e)),
    }
}

/// Answer a fatal error if the client is still listening and end the session
fn fail<S: Write>(stream: &mut S, session: &mut SmtpSession, err: &SmtpError) -> ShouldClose {
    warn!(error = %err, state = ?session.state, "closing session");
    session.close();
    reply_best_effort(stream, &SmtpResponse::from(err));
    ShouldClose::Close(CloseReason::Failed)
}

fn reply_best_effort<S: Write>(stream: &mut S, response: &SmtpResponse) {
    if let Err(e) = send_response(stream, response) {
        debug!(error = %e, code = %response.code, "could not deliver final reply");
    }
}

/// Send a response to the client
fn send_response<S: Write>(stream: &mut S, response: &SmtpResponse) -> Result<(), SmtpError> {
    // Ensure response doesn't exceed maximum line length
    let formatted = response.format();
    if formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
        let truncated_response = SmtpResponse::new(&response.code, "Response too long (truncated)");
        stream.write_all(truncated_response.format().as_bytes())?;
    } else {
        stream.write_all(formatted.as_bytes())?;
    }
    stream.flush()?;
    debug!(reply = formatted.trim_end(), "sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::smtp::config::SmtpConfig;
    use crate::smtp::error::SinkError;
    use crate::smtp::store::{AcceptAll, MemoryStore, MessageId, MessageSink};

    /// Duplex stream that hands out one scripted chunk per read and records writes
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new<I, B>(chunks: I) -> Self
        where
            I: IntoIterator<Item = B>,
            B: AsRef<[u8]>,
        {
            Self {
                reads: chunks.into_iter().map(|c| Ok(c.as_ref().to_vec())).collect(),
                written: Vec::new(),
            }
        }

        fn then_error(mut self, kind: ErrorKind) -> Self {
            self.reads.push_back(Err(kind.into()));
            self
        }

        fn replies(&self) -> Vec<String> {
            String::from_utf8(self.written.clone())
                .unwrap()
                .split_terminator("\r\n")
                .map(str::to_string)
                .collect()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(chunk)) => {
                    assert!(chunk.len() <= buf.len(), "scripted chunk too large");
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Sink that counts calls and can be told to fail
    #[derive(Default)]
    struct CountingSink {
        calls: Mutex<Vec<(String, String, Vec<u8>)>>,
        fail: bool,
    }

    impl MessageSink for CountingSink {
        fn record(
            &self,
            sender: &str,
            recipient: &str,
            body: &[u8],
        ) -> Result<MessageId, SinkError> {
            if self.fail {
                return Err(SinkError::new("store unavailable"));
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push((sender.to_string(), recipient.to_string(), body.to_vec()));
            Ok(MessageId(calls.len() as u64))
        }
    }

    fn run(
        config: &SmtpConfig,
        sink: &dyn MessageSink,
        stream: &mut ScriptedStream,
    ) -> CloseReason {
        let handler = SmtpCommandHandler::new(config, &AcceptAll, sink);
        handle(stream, &handler, &Shutdown::new()).unwrap()
    }

    const ENVELOPE: [&str; 4] = [
        "HELO client.local\r\n",
        "MAIL FROM:<a@x.com>\r\n",
        "RCPT TO:<b@x.com>\r\n",
        "DATA\r\n",
    ];

    #[test]
    fn test_end_to_end_interior_dot_line() {
        let config = SmtpConfig::new("test.local");
        let store = MemoryStore::with_users(["b@x.com"]);
        let handler = SmtpCommandHandler::new(&config, &store, &store);
        let mut stream = ScriptedStream::new(
            ENVELOPE
                .iter()
                .copied()
                .chain(["Hello\r\n.\r\nWorld\r\n.\r\n", "QUIT\r\n"]),
        );

        let reason = handle(&mut stream, &handler, &Shutdown::new()).unwrap();

        assert_eq!(reason, CloseReason::Quit);
        assert_eq!(
            stream.replies(),
            vec![
                "220 test.local Service ready",
                "250 test.local Hello client.local",
                "250 OK",
                "250 OK",
                "354 End data with <CR><LF>.<CR><LF>",
                "250 OK: queued as 00000001",
                "221 Bye",
            ]
        );

        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].email.from, "a@x.com");
        assert_eq!(messages[0].email.to, "b@x.com");
        assert_eq!(messages[0].email.data, "Hello\r\n.\r\nWorld\r\n");
    }

    #[test]
    fn test_terminator_split_across_reads() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new(
            ENVELOPE
                .iter()
                .copied()
                .chain(["Subject: x\r\n\r\nbody\r\n.", "\r\n", "QUIT\r\n"]),
        );

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Quit);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, b"Subject: x\r\n\r\nbody\r\n");
    }

    #[test]
    fn test_pipelined_body_after_data() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new([
            "HELO client.local\r\nMAIL FROM:<a@x.com>\r\nRCPT TO:<b@x.com>\r\nDATA\r\nHi\r\n.\r\n",
            "QUIT\r\n",
        ]);

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Quit);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, b"Hi\r\n");
        assert_eq!(stream.replies().len(), 7);
    }

    #[test]
    fn test_empty_body() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new(ENVELOPE.iter().copied().chain([".\r\n"]));

        assert_eq!(
            run(&config, &sink, &mut stream),
            CloseReason::ClientDisconnected
        );

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2.is_empty());
    }

    #[test]
    fn test_second_message_on_same_connection() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new(ENVELOPE.iter().copied().chain([
            "one\r\n.\r\n",
            "MAIL FROM:<c@x.com>\r\n",
            "RCPT TO:<d@x.com>\r\n",
            "DATA\r\n",
            "two\r\n.\r\n",
            "QUIT\r\n",
        ]));

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Quit);

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "c@x.com");
        assert_eq!(calls[1].2, b"two\r\n");
    }

    #[test]
    fn test_unknown_recipient_closes_connection() {
        let config = SmtpConfig::default();
        let store = MemoryStore::with_users(["b@x.com"]);
        let handler = SmtpCommandHandler::new(&config, &store, &store);
        let mut stream = ScriptedStream::new([
            "HELO client.local\r\n",
            "MAIL FROM:<a@x.com>\r\n",
            "RCPT TO:<nobody@example.com>\r\n",
            "DATA\r\n",
        ]);

        let reason = handle(&mut stream, &handler, &Shutdown::new()).unwrap();

        assert_eq!(reason, CloseReason::RecipientRejected);
        assert_eq!(
            stream.replies().last().map(String::as_str),
            Some("550 nobody@example.com: user unknown")
        );
        // DATA was never read
        assert_eq!(stream.reads.len(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_recipient_can_keep_connection() {
        let config = SmtpConfig::default().with_close_on_unknown_recipient(false);
        let store = MemoryStore::with_users(["b@x.com"]);
        let handler = SmtpCommandHandler::new(&config, &store, &store);
        let mut stream = ScriptedStream::new([
            "HELO client.local\r\n",
            "MAIL FROM:<a@x.com>\r\n",
            "RCPT TO:<nobody@example.com>\r\n",
            "MAIL FROM:<a@x.com>\r\n",
            "RCPT TO:<b@x.com>\r\n",
            "DATA\r\n",
            "ok\r\n.\r\n",
            "QUIT\r\n",
        ]);

        let reason = handle(&mut stream, &handler, &Shutdown::new()).unwrap();

        assert_eq!(reason, CloseReason::Quit);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_recipient_before_sender() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new([
            "RCPT TO:<b@x.com>\r\n",
            "HELO client.local\r\n",
            "RCPT TO:<b@x.com>\r\n",
            "MAIL FROM:<a@x.com>\r\n",
            "RCPT TO:<b@x.com>\r\n",
            "DATA\r\n",
            "hi\r\n.\r\n",
            "RCPT TO:<c@x.com>\r\n",
            "RSET\r\n",
            "RCPT TO:<c@x.com>\r\n",
            "NOOP\r\n",
            "VRFY b@x.com\r\n",
            "QUIT\r\n",
        ]);

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Quit);

        let codes: Vec<String> = stream.replies().iter().map(|r| r[..3].to_string()).collect();
        assert_eq!(
            codes,
            vec![
                "220", "503", "250", "503", "250", "250", "354", "250", "503", "250", "503", "250",
                "502", "221"
            ]
        );
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_oversized_body_is_not_recorded() {
        let config = SmtpConfig::default().with_max_message_size(16);
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new(
            ENVELOPE
                .iter()
                .copied()
                .chain(["This body is definitely longer than sixteen bytes\r\n.\r\n"]),
        );

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Failed);

        assert!(sink.calls.lock().unwrap().is_empty());
        assert!(stream.replies().last().unwrap().starts_with("552"));
    }

    #[test]
    fn test_sink_failure_is_reported() {
        let config = SmtpConfig::default();
        let sink = CountingSink {
            fail: true,
            ..CountingSink::default()
        };
        let mut stream = ScriptedStream::new(ENVELOPE.iter().copied().chain(["hi\r\n.\r\n"]));

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Failed);
        assert!(stream.replies().last().unwrap().starts_with("451"));
    }

    #[test]
    fn test_disconnect_mid_body() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let mut stream = ScriptedStream::new(ENVELOPE.iter().copied().chain(["half a mess"]));

        assert_eq!(
            run(&config, &sink, &mut stream),
            CloseReason::ClientDisconnected
        );
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_read_timeout() {
        let config = SmtpConfig::new("test.local");
        let sink = CountingSink::default();
        let mut stream =
            ScriptedStream::new(["HELO client.local\r\n"]).then_error(ErrorKind::WouldBlock);

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::TimedOut);
        assert_eq!(
            stream.replies().last().map(String::as_str),
            Some("421 test.local timeout")
        );
    }

    #[test]
    fn test_transport_error() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let handler = SmtpCommandHandler::new(&config, &AcceptAll, &sink);
        let mut stream = ScriptedStream::new(ENVELOPE).then_error(ErrorKind::ConnectionReset);

        let result = handle(&mut stream, &handler, &Shutdown::new());
        assert!(matches!(result, Err(SmtpError::Io(_))));
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_long_line() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let long = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
        let mut stream = ScriptedStream::new([long]);

        assert_eq!(run(&config, &sink, &mut stream), CloseReason::Failed);
        assert!(stream.replies().last().unwrap().starts_with("500"));
    }

    #[test]
    fn test_shutdown_aborts_session() {
        let config = SmtpConfig::default();
        let sink = CountingSink::default();
        let handler = SmtpCommandHandler::new(&config, &AcceptAll, &sink);
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut stream = ScriptedStream::new(ENVELOPE);

        let reason = handle(&mut stream, &handler, &shutdown).unwrap();

        assert_eq!(reason, CloseReason::Aborted);
        assert_eq!(stream.replies().len(), 1);
    }
}
