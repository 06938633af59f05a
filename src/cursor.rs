//! # Cursor Utilities
//!
//! Opaque keyset cursors for job listings: base64 of `{"scheduled_at", "id"}`,
//! the last row of the previous page.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const MAX_ENCODED_LEN: usize = 1000;
const MAX_DECODED_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCursor {
    pub scheduled_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor cannot be empty")]
    Empty,
    #[error("cursor is too long")]
    TooLong,
    #[error("cursor is not valid base64")]
    InvalidBase64,
    #[error("cursor contains invalid JSON structure")]
    InvalidJson,
    #[error("cursor contains invalid ID")]
    NilId,
}

impl JobCursor {
    pub fn new(scheduled_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { scheduled_at, id }
    }

    pub fn encode(&self) -> String {
        // Two plain fields; serialization cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(cursor: &str) -> Result<Self, CursorError> {
        if cursor.is_empty() {
            return Err(CursorError::Empty);
        }
        if cursor.len() > MAX_ENCODED_LEN {
            return Err(CursorError::TooLong);
        }

        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| CursorError::InvalidBase64)?;
        if decoded.len() > MAX_DECODED_LEN {
            return Err(CursorError::TooLong);
        }

        let data: JobCursor =
            serde_json::from_slice(&decoded).map_err(|_| CursorError::InvalidJson)?;
        if data.id.is_nil() {
            return Err(CursorError::NilId);
        }
        Ok(data)
    }
}
