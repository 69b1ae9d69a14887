//! Image id generation and validation.

use lazy_static::lazy_static;
use layerd_core::error::{GraphError, Result};
use rand::RngCore;
use regex::Regex;

/// Length of a full image id in hex characters.
pub const ID_LENGTH: usize = 64;

lazy_static! {
    static ref ID_RE: Regex = Regex::new(r"^[a-f0-9]{64}$").unwrap();
}

/// Validate the syntactic id rule: 64 lowercase hex characters.
pub fn validate_id(id: &str) -> Result<()> {
    if ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(GraphError::InvalidId(id.to_string()))
    }
}

/// Generate a random image id: 32 random bytes, hex encoded.
///
/// Also used for scratch directory names, where only uniqueness matters.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Shorten an id for display.
pub fn truncate_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
