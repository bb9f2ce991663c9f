//! SMTP session state management

use tracing::debug;

use crate::smtp::commands::Verb;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::framer::MessageFramer;

/// Represents the current phase of an SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Connection accepted, waiting for HELO/EHLO
    Connected,
    /// HELO/EHLO received, ready for MAIL
    Greeted,
    /// MAIL FROM received, ready for RCPT
    SenderSet,
    /// RCPT TO accepted, ready for DATA
    RecipientSet,
    /// DATA accepted, body bytes go to the framer
    ReceivingBody,
    /// The message was handed to the sink
    Completed,
    /// The session is over
    Closed,
}

/// The message being assembled in a session.
///
/// Fields fill in order, sender then recipient then body, and are only cleared by starting a
/// new message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl Envelope {
    /// Sender, recipient and body are all present
    pub fn is_complete(&self) -> bool {
        self.sender.is_some() && self.recipient.is_some() && self.body.is_some()
    }
}

/// Manages the state and data for a single SMTP session
#[derive(Debug)]
pub struct SmtpSession {
    /// Current phase of the session
    pub state: SmtpState,
    /// The message in progress
    pub envelope: Envelope,
    /// Client domain from HELO/EHLO
    pub client_domain: Option<String>,
    framer: Option<MessageFramer>,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new() -> Self {
        Self {
            state: SmtpState::Connected,
            envelope: Envelope::default(),
            client_domain: None,
            framer: None,
        }
    }

    /// Whether body bytes should go to [`Self::receive_data`] rather than the line reader
    pub fn in_data_mode(&self) -> bool {
        self.state == SmtpState::ReceivingBody
    }

    pub fn is_closed(&self) -> bool {
        self.state == SmtpState::Closed
    }

    /// Drop the message in progress and go back to waiting for MAIL
    pub fn reset(&mut self) {
        self.envelope = Envelope::default();
        self.framer = None;
        if self.state != SmtpState::Connected && self.state != SmtpState::Closed {
            self.state = SmtpState::Greeted;
        }
    }

    /// End the session, discarding any partial message
    pub fn close(&mut self) {
        if self.state != SmtpState::Completed && self.envelope.sender.is_some() {
            debug!(state = ?self.state, "discarding unfinished envelope");
        }
        self.envelope = Envelope::default();
        self.framer = None;
        self.state = SmtpState::Closed;
    }

    /// Record the client domain from HELO/EHLO.
    ///
    /// The first greeting moves the session to [`SmtpState::Greeted`]. A repeated greeting only
    /// replaces the domain and leaves the message in progress alone.
    pub fn set_client_domain(&mut self, domain: String) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain);
        if self.state == SmtpState::Connected {
            self.state = SmtpState::Greeted;
        }
        Ok(())
    }

    /// Set the sender address, starting a new message
    pub fn set_sender(&mut self, sender: String) -> Result<(), SmtpError> {
        if !self.can_execute_command(Verb::Mail) {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        if sender.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "FROM address cannot be empty".to_string(),
            ));
        }

        if sender.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        if matches!(self.state, SmtpState::SenderSet | SmtpState::RecipientSet) {
            debug!("MAIL restarts the message in progress");
        }

        self.envelope = Envelope {
            sender: Some(sender),
            ..Envelope::default()
        };
        self.state = SmtpState::SenderSet;
        Ok(())
    }

    /// Attach the recipient address. It must already have passed validation.
    pub fn set_recipient(&mut self, recipient: String) -> Result<(), SmtpError> {
        if self.state == SmtpState::RecipientSet {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        if !self.can_execute_command(Verb::Rcpt) {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        if recipient.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.envelope.recipient = Some(recipient);
        self.state = SmtpState::RecipientSet;
        Ok(())
    }

    /// Start body collection, accepting at most `max_size` bytes
    pub fn start_data_mode(&mut self, max_size: usize) -> Result<(), SmtpError> {
        if !self.can_execute_command(Verb::Data) {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        self.framer = Some(MessageFramer::new(max_size));
        self.state = SmtpState::ReceivingBody;
        Ok(())
    }

    /// Feed body bytes to the framer.
    ///
    /// Returns the finished envelope once the terminator arrives; the session then sits in
    /// [`SmtpState::Completed`]. A size-limit failure closes the session and discards the
    /// message.
    pub fn receive_data(&mut self, chunk: &[u8]) -> Result<Option<&Envelope>, SmtpError> {
        let framer = self.framer.as_mut().ok_or_else(|| {
            SmtpError::InvalidState("Not in data collection mode".to_string())
        })?;

        match framer.push(chunk) {
            Ok(Some(body)) => {
                self.framer = None;
                self.envelope.body = Some(body);
                self.state = SmtpState::Completed;
                Ok(Some(&self.envelope))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute_command(&self, verb: Verb) -> bool {
        match verb {
            Verb::Helo | Verb::Ehlo | Verb::Noop | Verb::Quit => self.state != SmtpState::Closed,
            Verb::Mail => matches!(
                self.state,
                SmtpState::Greeted
                    | SmtpState::SenderSet
                    | SmtpState::RecipientSet
                    | SmtpState::Completed
            ),
            Verb::Rcpt => self.state == SmtpState::SenderSet,
            Verb::Data => self.state == SmtpState::RecipientSet,
            Verb::Rset => !matches!(self.state, SmtpState::Connected | SmtpState::Closed),
            Verb::Unrecognized => false,
        }
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}
