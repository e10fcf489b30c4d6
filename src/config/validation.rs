//! Settings validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Detect incomplete TLS setups (certificate without key, mTLS without TLS)
//! - Reject prefork on a dual-stack network
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: StartSettings → Result<(), Vec<ValidationError>>

use std::fmt;

use crate::config::loader::StartSettings;
use crate::config::schema::ListenerNetwork;

/// A single semantic problem in the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_settings(settings: &StartSettings) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match (&settings.cert_file, &settings.cert_key_file) {
        (Some(_), None) => errors.push(ValidationError::new(
            "cert_key_file",
            "required when cert_file is set",
        )),
        (None, Some(_)) => errors.push(ValidationError::new(
            "cert_file",
            "required when cert_key_file is set",
        )),
        _ => {}
    }

    let tls = settings.cert_file.is_some() && settings.cert_key_file.is_some();
    if settings.cert_client_file.is_some() && !tls {
        errors.push(ValidationError::new(
            "cert_client_file",
            "mutual TLS needs cert_file and cert_key_file",
        ));
    }

    if settings.enable_prefork && settings.listener_network == Some(ListenerNetwork::Tcp) {
        errors.push(ValidationError::new(
            "listener_network",
            "prefork only supports tcp4 or tcp6",
        ));
    }

    if settings.prefork_processes == Some(0) {
        errors.push(ValidationError::new(
            "prefork_processes",
            "must be greater than zero",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
