use crate::error::{AppError, Result};

/// Longest message accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Longest display name accepted, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Validates an outgoing message.
///
/// # Returns
///
/// The trimmed text to send.
pub fn validate_message(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Message must not be empty".to_string()));
    }

    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation(format!(
            "Message must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }

    Ok(trimmed)
}

/// Validates the name a participant joins with.
///
/// # Returns
///
/// The trimmed display name.
pub fn validate_display_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Display name must not be empty".to_string()));
    }

    if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(AppError::Validation(format!(
            "Display name must be at most {} characters",
            MAX_DISPLAY_NAME_CHARS
        )));
    }

    if trimmed.chars().any(char::is_control) {
        return Err(AppError::Validation(
            "Display name cannot contain control characters".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_rejects_blank_messages() {
        assert_eq!(validate_message("  hi \n").unwrap(), "hi");
        assert!(validate_message("   ").is_err());
        assert!(validate_message("").is_err());
    }

    #[test]
    fn rejects_oversized_messages() {
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(validate_message(&"a".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
    }

    #[test]
    fn display_names() {
        assert_eq!(validate_display_name(" sam#1234 ").unwrap(), "sam#1234");
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("a\u{7}b").is_err());
        assert!(validate_display_name(&"x".repeat(MAX_DISPLAY_NAME_CHARS + 1)).is_err());
    }
}
