//! Email data structures and functionality

use std::time::SystemTime;

/// A message received by the SMTP server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// The sender's email address
    pub from: String,

    /// The recipient's email address
    pub to: String,

    /// The email content including headers and body
    pub data: String,

    /// When the email was received by the server
    pub timestamp: SystemTime,
}

impl Email {
    /// Create a new email
    pub fn new(from: String, to: String, data: String) -> Self {
        Self {
            from,
            to,
            data,
            timestamp: SystemTime::now(),
        }
    }

    /// Build an email from raw envelope parts, replacing invalid UTF-8 in the body
    pub fn from_parts(sender: &str, recipient: &str, body: &[u8]) -> Self {
        Self::new(
            sender.to_owned(),
            recipient.to_owned(),
            String::from_utf8_lossy(body).into_owned(),
        )
    }

    /// Check if this email was sent to a specific recipient
    pub fn is_to(&self, recipient: &str) -> bool {
        self.to == recipient
    }

    /// Check if this email was sent from a specific sender
    pub fn is_from_sender(&self, sender: &str) -> bool {
        self.from == sender
    }

    /// Get the size of the email data in bytes
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Get the subject line from the email headers (if present)
    pub fn get_subject(&self) -> Option<&str> {
        for line in self.data.lines() {
            if line.is_empty() {
                // End of headers
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("subject") {
                    return Some(value.trim_start());
                }
            }
        }
        None
    }

    /// Get the message body (content after the first empty line)
    pub fn get_body(&self) -> Option<&str> {
        let start = ["\r\n\r\n", "\n\n"]
            .iter()
            .filter_map(|separator| {
                self.data
                    .find(separator)
                    .map(|index| index + separator.len())
            })
            .min()?;

        if start < self.data.len() {
            Some(&self.data[start..])
        } else {
            None
        }
    }

    /// Check if the email contains a specific text in headers or body
    pub fn contains_text(&self, text: &str) -> bool {
        self.data.contains(text)
    }
}
