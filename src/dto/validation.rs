//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_ROOM_ID_LEN: usize = 128;

/// Validates a room id as typed or pasted by a user.
///
/// Room ids are document ids, so they must be non-empty, reasonably short and
/// free of path separators and whitespace.
pub fn validate_room_id(id: &str) -> Result<(), ValidationError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_ROOM_ID_LEN {
        let mut err = ValidationError::new("room_id_length");
        err.message = Some(
            format!("Room id must be 1 to {MAX_ROOM_ID_LEN} characters (got {})", trimmed.len())
                .into(),
        );
        return Err(err);
    }

    if trimmed.chars().any(|c| c == '/' || c.is_whitespace()) {
        let mut err = ValidationError::new("room_id_format");
        err.message = Some("Room id must not contain '/' or whitespace".into());
        return Err(err);
    }

    Ok(())
}

/// Validates a two letter region code such as `IN` or `US`.
pub fn validate_region(region: &str) -> Result<(), ValidationError> {
    if region.len() != 2 || !region.chars().all(|c| c.is_ascii_alphabetic()) {
        let mut err = ValidationError::new("region_format");
        err.message = Some("Region must be a two letter country code".into());
        return Err(err);
    }
    Ok(())
}

/// Validates a reaction emoji: one short grapheme-ish token without spaces.
pub fn validate_emoji(emoji: &str) -> Result<(), ValidationError> {
    let count = emoji.chars().count();
    if count == 0 || count > 8 || emoji.chars().any(char::is_whitespace) {
        let mut err = ValidationError::new("emoji_format");
        err.message = Some("Reaction must be a single emoji".into());
        return Err(err);
    }
    Ok(())
}
