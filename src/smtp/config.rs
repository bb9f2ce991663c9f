//! Server configuration

use std::time::Duration;

use crate::smtp::error::SmtpLimits;

/// How long a session may sit idle before the server hangs up.
///
/// RFC 5321 section 4.5.3.2.7 asks servers to wait at least five minutes for the next command.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Settings shared by every session of a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Name used in the greeting and HELO/EHLO replies
    pub hostname: String,
    /// Largest body accepted, in bytes
    pub max_message_size: usize,
    /// Idle limit for a single read, `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Hang up after rejecting an unknown recipient
    pub close_on_unknown_recipient: bool,
}

impl SmtpConfig {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            ..Self::default()
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_close_on_unknown_recipient(mut self, close: bool) -> Self {
        self.close_on_unknown_recipient = close;
        self
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            max_message_size: SmtpLimits::MAX_DATA_SIZE,
            read_timeout: Some(SERVER_TIMEOUT),
            close_on_unknown_recipient: true,
        }
    }
}
