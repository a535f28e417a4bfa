use std::fmt;

/// Validation errors for sensor and config key names
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyName,
    InvalidNameFormat(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyName => write!(f, "name is required"),
            ValidationError::InvalidNameFormat(s) => {
                write!(
                    f,
                    "invalid name '{}': must be lowercase segments separated by dots",
                    s
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a sensor or config key name.
///
/// Valid names:
/// - Lowercase letters (a-z), numbers (0-9), underscores
/// - Dots (.) for hierarchy
/// - No leading/trailing dots
/// - No consecutive dots
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if !is_valid_name(name) {
        return Err(ValidationError::InvalidNameFormat(name.to_string()));
    }
    Ok(())
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    if name.starts_with('.') || name.ends_with('.') {
        return false;
    }

    if name.contains("..") {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}
