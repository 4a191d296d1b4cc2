use crate::error::Error;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::fmt;

pub const MAX_DESTINATION_LEN: usize = 16;
pub const MAX_BODY_LEN: usize = 160;
pub const MAX_GATEWAY_STATUS_LEN: usize = 20;
pub const MAX_GATEWAY_RESPONSE_LEN: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(i32)]
pub enum MessageStatus {
    Queued = 0,
    SentOk = 1,
    SentError = -1,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Queued)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub destination: String,
    pub body: String,
    pub status: MessageStatus,
    pub gateway_status: Option<String>,
    pub gateway_response: Option<String>,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{:?}] {} {:?} (created {}, modified {}",
            self.id,
            self.status,
            self.destination,
            self.body,
            self.created.to_rfc3339(),
            self.modified.to_rfc3339(),
        )?;
        if let Some(status) = &self.gateway_status {
            write!(f, ", gateway {}", status)?;
        }
        if let Some(response) = &self.gateway_response {
            write!(f, ", response {:?}", response)?;
        }
        write!(f, ")")
    }
}

/// Rejects destinations and bodies the gateway protocol cannot carry.
pub fn validate_outgoing(destination: &str, body: &str) -> Result<(), Error> {
    let destination_len = destination.chars().count();
    if destination_len == 0 || destination_len > MAX_DESTINATION_LEN {
        return Err(Error::InvalidMessage(format!(
            "destination must be 1..={} characters, got {}",
            MAX_DESTINATION_LEN, destination_len
        )));
    }
    let body_len = body.chars().count();
    if body_len == 0 || body_len > MAX_BODY_LEN {
        return Err(Error::InvalidMessage(format!(
            "body must be 1..={} characters, got {}",
            MAX_BODY_LEN, body_len
        )));
    }
    Ok(())
}

pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}
