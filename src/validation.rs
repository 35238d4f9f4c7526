use crate::error::ValidationError;

pub fn require_secret(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptySecret);
    }
    Ok(())
}

pub fn require_non_negative(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::NegativeQuota { field });
    }
    Ok(())
}
