use crate::error::GuardError;
use crate::invalidator::EntityChange;
use crate::rate_limiter::Reputation;
use serde::Deserialize;
use std::net::IpAddr;
use validator::{Validate, ValidationError};

/// Body of `POST /rate-limit/check`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckRateLimitRequest {
    #[validate(length(min = 1, max = 256), custom(function = "validate_subject"))]
    pub subject: String,
    #[validate(range(min = 1))]
    pub limit: u64,
    #[validate(range(min = 1, max = 86400))]
    pub window_seconds: u64,
}

/// Body of `PUT /reputation/:ip`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReputationRequest {
    pub reputation: Reputation,
}

/// Subjects end up inside store keys; wildcards and whitespace are refused.
pub fn validate_subject(subject: &str) -> Result<(), ValidationError> {
    let valid = subject
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("subject_format");
        err.message = Some("Subject may only contain alphanumerics and : - _ . @".into());
        Err(err)
    }
}

pub fn validate_ip(ip: &str) -> Result<IpAddr, GuardError> {
    ip.trim()
        .parse::<IpAddr>()
        .map_err(|_| GuardError::Validation(format!("'{}' is not a valid IP address", ip)))
}

pub fn validate_circuit_name(name: &str) -> Result<(), GuardError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GuardError::Validation(
            "Circuit name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(GuardError::Validation(
            "Circuit name cannot exceed 128 characters".to_string(),
        ));
    }

    if !name.chars().all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')) {
        return Err(GuardError::Validation(
            "Circuit name can only contain alphanumeric characters, hyphens, underscores, dots and colons".to_string(),
        ));
    }

    Ok(())
}

/// Every id carried by an entity change must be non-empty.
pub fn validate_entity_change(change: &EntityChange) -> Result<(), GuardError> {
    let ids: Vec<Option<&str>> = match change {
        EntityChange::User { user_id } => vec![Some(user_id.as_str())],
        EntityChange::Account {
            account_id,
            user_id,
        } => vec![Some(account_id.as_str()), user_id.as_deref()],
        EntityChange::Transaction {
            transaction_id,
            account_id,
            user_id,
        } => vec![
            Some(transaction_id.as_str()),
            account_id.as_deref(),
            user_id.as_deref(),
        ],
        EntityChange::Invoice {
            invoice_id,
            customer_id,
            tenant_id,
        } => vec![
            Some(invoice_id.as_str()),
            customer_id.as_deref(),
            tenant_id.as_deref(),
        ],
        EntityChange::Tenant { tenant_id } | EntityChange::Report { tenant_id } => {
            vec![Some(tenant_id.as_str())]
        }
    };

    if ids.into_iter().flatten().any(|id| id.trim().is_empty()) {
        return Err(GuardError::Validation(
            "Entity ids cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_redis_url(url: &str) -> Result<(), GuardError> {
    if url.is_empty() {
        return Err(GuardError::Validation(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(GuardError::Validation(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_bind_address(address: &str) -> Result<(), GuardError> {
    if address.is_empty() {
        return Err(GuardError::Validation(
            "Bind address cannot be empty".to_string(),
        ));
    }

    // Check if it looks like host:port format
    if !address.contains(':') {
        return Err(GuardError::Validation(
            "Bind address must be in host:port format".to_string(),
        ));
    }

    Ok(())
}

/// Validate a request body, mapping failures onto [`GuardError::Validation`].
pub fn validate_body<T: Validate>(body: &T) -> Result<(), GuardError> {
    body.validate().map_err(GuardError::from)
}
