//! SMTP server implementation

pub mod commands;
pub mod config;
pub mod connection;
pub mod email;
pub mod error;
pub mod framer;
pub mod reader;
pub mod response;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;

pub use commands::{Command, SmtpCommandHandler, Verb};
pub use config::SmtpConfig;
pub use connection::CloseReason;
pub use email::Email;
pub use error::{SinkError, SmtpError, SmtpLimits};
pub use framer::{FrameState, MessageFramer};
pub use reader::LineReader;
pub use response::SmtpResponse;
pub use server::SmtpServer;
pub use session::{Envelope, SmtpSession, SmtpState};
pub use shutdown::Shutdown;
pub use store::{
    AcceptAll, ChannelSink, MemoryStore, MessageId, MessageSink, RecipientValidator,
    StoredMessage, UserId,
};
