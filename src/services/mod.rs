// Catalog
pub mod catalog;
pub mod plans;

// Devices and fulfillment
pub mod devices;
pub mod orders;
pub mod webhook;

// Payment provider
pub mod payments;

// Accounts
pub mod customers;
pub mod employees;

// Messaging
pub mod notifications;

// Object storage
pub mod storage;

use crate::errors::ServiceError;

/// Rejects a patch that carries no usable field.
pub(crate) fn require_any_field(present: bool) -> Result<(), ServiceError> {
    if present {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(
            "At least one valid field must be provided".to_string(),
        ))
    }
}

/// Treats blank strings as absent.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
