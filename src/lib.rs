//! # Postern
//!
//! Postern is a single-recipient SMTP intake server.
//!
//! It accepts one message per envelope, checks the recipient against a
//! [`RecipientValidator`] before accepting it, and hands the finished message to a
//! [`MessageSink`] as soon as the terminating `.` line arrives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use postern::{ChannelSink, MemoryStore, SmtpServer};
//! use std::sync::{Arc, mpsc};
//! use std::thread;
//! use std::time::Duration;
//!
//! let (tx, rx) = mpsc::channel();
//! let directory = Arc::new(MemoryStore::with_users(["tarou@example.com"]));
//! let server = SmtpServer::new("test.local", directory, Arc::new(ChannelSink::new(tx)));
//!
//! thread::spawn(move || {
//!     server.start("127.0.0.1:2525").unwrap();
//! });
//!
//! // Application sends email to localhost:2525
//! // ...
//!
//! if let Ok(email) = rx.recv_timeout(Duration::from_millis(100)) {
//!     println!("Received email from: {}", email.from);
//! }
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the client
//! - `MAIL FROM` - Specify the sender's address, starting a new message
//! - `RCPT TO` - Specify the one recipient of the message
//! - `DATA` - Send the message body, ended by a line holding a single `.`
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! Anything else is answered with `502`.
//!
//! ## Notes
//!
//! - Only one recipient per message. A second `RCPT` is answered with `452`.
//! - An unknown recipient gets `550` and, unless configured otherwise, the connection is closed.
//! - The message body is stored exactly as received; no dot-unstuffing is done.
//! - Only `SIZE` is advertised in the `EHLO` reply, and nothing is negotiated.
//! - SMTP authentication, TLS and relaying are not supported.
//!
//! ## Size Limits
//!
//! The server enforces RFC 821 size limits:
//! - User names: 64 characters max
//! - Domain names: 64 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//!
//! Message bodies are capped by [`SmtpConfig::max_message_size`], 10 MiB by default.

mod smtp;

pub use smtp::framer::{TERMINATOR, frame};
pub use smtp::{
    AcceptAll, ChannelSink, CloseReason, Command, Email, Envelope, FrameState, LineReader,
    MemoryStore, MessageFramer, MessageId, MessageSink, RecipientValidator, Shutdown, SinkError,
    SmtpCommandHandler, SmtpConfig, SmtpError, SmtpLimits, SmtpResponse, SmtpServer, SmtpSession,
    SmtpState, StoredMessage, UserId, Verb,
};
pub use smtp::commands::parse as parse_command;
pub use smtp::connection::handle as handle_connection;
