//! Parsing and handling of SMTP commands

use tracing::{debug, info, warn};

use crate::smtp::config::SmtpConfig;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SmtpSession, SmtpState};
use crate::smtp::store::{MessageSink, RecipientValidator};

/// Length of every command keyword
const VERB_LENGTH: usize = 4;

/// Command keyword, matched on the first four characters of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Unrecognized,
}

impl Verb {
    fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "HELO" => Verb::Helo,
            "EHLO" => Verb::Ehlo,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            "NOOP" => Verb::Noop,
            "QUIT" => Verb::Quit,
            _ => Verb::Unrecognized,
        }
    }
}

/// One command line split into keyword and argument text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub verb: Verb,
    /// Everything after the keyword, trimmed
    pub argument: &'a str,
}

/// Split a command line into keyword and argument.
///
/// The keyword is the first four characters, compared case-insensitively, and has to be
/// followed by a space or the end of the line. Anything else yields [`Verb::Unrecognized`]
/// instead of an error.
pub fn parse(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);

    let (keyword, rest) = match (line.get(..VERB_LENGTH), line.get(VERB_LENGTH..)) {
        (Some(keyword), Some(rest)) => (keyword, rest),
        _ => {
            return Command {
                verb: Verb::Unrecognized,
                argument: line,
            };
        }
    };

    if !(rest.is_empty() || rest.starts_with(' ')) {
        return Command {
            verb: Verb::Unrecognized,
            argument: line,
        };
    }

    Command {
        verb: Verb::from_keyword(keyword),
        argument: rest.trim(),
    }
}

/// Pull the address out of a `FROM:<addr>` / `TO:<addr>` argument.
///
/// `prefix` is the expected delimiter (`FROM:` or `TO:`), matched case-insensitively. The
/// address is the text inside angle brackets; without brackets it is the first word. ESMTP
/// parameters after the address are ignored.
pub fn parse_path(argument: &str, prefix: &str) -> Result<String, SmtpError> {
    let path = match argument.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => argument[prefix.len()..].trim_start(),
        _ => {
            return Err(SmtpError::InvalidSyntax(format!(
                "expected {prefix}<address>"
            )));
        }
    };

    let address = if let Some(bracketed) = path.strip_prefix('<') {
        match bracketed.split_once('>') {
            Some((address, _parameters)) => address,
            None => {
                return Err(SmtpError::InvalidSyntax(
                    "unterminated angle bracket".to_string(),
                ));
            }
        }
    } else {
        path.split_whitespace().next().unwrap_or_default()
    };

    Ok(address.trim().to_string())
}

/// Handles SMTP commands and returns appropriate responses
pub struct SmtpCommandHandler<'a> {
    config: &'a SmtpConfig,
    validator: &'a dyn RecipientValidator,
    sink: &'a dyn MessageSink,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(
        config: &'a SmtpConfig,
        validator: &'a dyn RecipientValidator,
        sink: &'a dyn MessageSink,
    ) -> Self {
        Self {
            config,
            validator,
            sink,
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        self.config
    }

    /// Process a command line and return a response.
    ///
    /// Errors are meant to be answered with [`SmtpResponse::from`]; the session state tells
    /// whether the connection should stay open afterwards.
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        // Check command line length
        if command_line.len() + 2 > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let command = parse(command_line);
        debug!(
            verb = ?command.verb,
            argument = command.argument,
            state = ?session.state,
            "command"
        );

        match command.verb {
            Verb::Helo => self.handle_helo(command, session),
            Verb::Ehlo => self.handle_ehlo(command, session),
            Verb::Mail => self.handle_mail(command, session),
            Verb::Rcpt => self.handle_rcpt(command, session),
            Verb::Data => self.handle_data(command, session),
            Verb::Rset => self.handle_rset(session),
            Verb::Noop => Ok(SmtpResponse::ok()),
            Verb::Quit => self.handle_quit(session),
            Verb::Unrecognized => Err(SmtpError::NotImplemented(
                command_line.split_whitespace().next().unwrap_or_default().to_string(),
            )),
        }
    }

    /// Feed body bytes to the session and store the message once it is complete.
    ///
    /// Returns `Ok(None)` while more bytes are needed. A sink failure closes the session.
    pub fn process_data(
        &self,
        chunk: &[u8],
        session: &mut SmtpSession,
    ) -> Result<Option<SmtpResponse>, SmtpError> {
        let Some(envelope) = session.receive_data(chunk)? else {
            return Ok(None);
        };

        let (Some(sender), Some(recipient), Some(body)) = (
            envelope.sender.as_deref(),
            envelope.recipient.as_deref(),
            envelope.body.as_deref(),
        ) else {
            session.close();
            return Err(SmtpError::InvalidState(
                "completed message lacks sender or recipient".to_string(),
            ));
        };

        match self.sink.record(sender, recipient, body) {
            Ok(id) => {
                info!(%id, sender, recipient, size = body.len(), "message accepted");
                Ok(Some(SmtpResponse::queued(&id.to_string())))
            }
            Err(e) => {
                warn!(error = %e, sender, recipient, "message sink failed");
                session.close();
                Err(e.into())
            }
        }
    }

    /// Handle HELO command
    fn handle_helo(
        &self,
        command: Command<'_>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = Self::greeting_domain(command, "HELO")?;
        session.set_client_domain(client_domain.to_string())?;

        Ok(SmtpResponse::helo(&self.config.hostname, client_domain))
    }

    /// Handle EHLO command
    fn handle_ehlo(
        &self,
        command: Command<'_>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = Self::greeting_domain(command, "EHLO")?;
        session.set_client_domain(client_domain.to_string())?;

        Ok(SmtpResponse::ehlo(
            &self.config.hostname,
            client_domain,
            self.config.max_message_size,
        ))
    }

    fn greeting_domain<'c>(command: Command<'c>, verb: &str) -> Result<&'c str, SmtpError> {
        command
            .argument
            .split_whitespace()
            .next()
            .ok_or_else(|| SmtpError::InvalidSyntax(format!("{verb} requires domain argument")))
    }

    /// Handle MAIL command
    fn handle_mail(
        &self,
        command: Command<'_>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command(Verb::Mail) {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        let addr = parse_path(command.argument, "FROM:")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "FROM address cannot be empty".to_string(),
            ));
        }

        // Validate email address components
        self.validate_email_address(&addr)?;

        session.set_sender(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command
    fn handle_rcpt(
        &self,
        command: Command<'_>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if session.state == SmtpState::RecipientSet {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        if !session.can_execute_command(Verb::Rcpt) {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        let addr = parse_path(command.argument, "TO:")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        // Validate email address components
        self.validate_email_address(&addr)?;

        if !self.validator.exists(&addr) {
            info!(recipient = %addr, "rejecting unknown recipient");
            if self.config.close_on_unknown_recipient {
                session.close();
            } else {
                session.reset();
            }
            return Err(SmtpError::UnknownRecipient(addr));
        }

        session.set_recipient(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle DATA command
    fn handle_data(
        &self,
        command: Command<'_>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command(Verb::Data) {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if !command.argument.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.start_data_mode(self.config.max_message_size)?;

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command(Verb::Rset) {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        session.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command
    fn handle_quit(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        session.close();
        Ok(SmtpResponse::quit())
    }

    /// Validate email address format and size limits
    fn validate_email_address(&self, addr: &str) -> Result<(), SmtpError> {
        if addr.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        let Some((user_part, domain_part)) = addr.rsplit_once('@') else {
            return Err(SmtpError::InvalidSyntax(
                "Email address must contain @ symbol".to_string(),
            ));
        };

        if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
            return Err(SmtpError::UserTooLong {
                max: SmtpLimits::USER_MAX_LENGTH,
            });
        }

        if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        // Basic validation - must have user and domain parts
        if user_part.is_empty() || domain_part.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "Invalid email address format".to_string(),
            ));
        }

        Ok(())
    }
}
