//! Key construction shared by the cache-aside wrapper, the rate limiter and
//! the invalidator. Cache views are namespaced by entity so the invalidator
//! can remove them with prefix patterns.

use crate::error::GuardError;
use serde::Serialize;
use std::net::IpAddr;

pub const RATE_LIMIT_PREFIX: &str = "rate_limit";
pub const REPUTATION_PREFIX: &str = "reputation:ip";

/// Deterministic cache key for an operation and its arguments.
///
/// Arguments are serialized to JSON with object keys sorted, so two calls
/// with equal arguments always produce the same key.
pub fn cache_key<A: Serialize + ?Sized>(operation: &str, args: &A) -> Result<String, GuardError> {
    let value = serde_json::to_value(args)?;
    Ok(format!("{}:{}", operation, value))
}

/// Key for one subject's counter in one fixed window.
pub fn rate_limit_key(scope: &str, subject: &str, window_start: u64) -> String {
    format!(
        "{}:{}:{}:{}",
        RATE_LIMIT_PREFIX,
        sanitize_key(scope),
        sanitize_key(subject),
        window_start
    )
}

pub fn reputation_key(ip: &str) -> String {
    format!("{}:{}", REPUTATION_PREFIX, sanitize_key(&canonical_ip(ip)))
}

/// Textual form of `ip` that equal addresses share: IPv6 is lowercased and
/// compressed, IPv4-mapped IPv6 becomes plain IPv4. Unparseable input is
/// returned trimmed.
pub fn canonical_ip(ip: &str) -> String {
    let ip = ip.trim();
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(addr) => addr.to_string(),
        Err(_) => ip.to_string(),
    }
}

/// Cache view names for the accounting domain. Values cached under these
/// prefixes are what [`crate::invalidator`] removes, so ids are sanitised
/// here and nowhere else.
pub mod views {
    use super::sanitize_key;

    pub fn user(user_id: &str) -> String {
        format!("user:{}", sanitize_key(user_id))
    }

    pub fn user_transactions(user_id: &str) -> String {
        format!("transactions:user:{}", sanitize_key(user_id))
    }

    pub fn user_balance(user_id: &str) -> String {
        format!("balance:user:{}", sanitize_key(user_id))
    }

    pub fn user_dashboard(user_id: &str) -> String {
        format!("dashboard:user:{}", sanitize_key(user_id))
    }

    pub fn account(account_id: &str) -> String {
        format!("account:{}", sanitize_key(account_id))
    }

    pub fn account_transactions(account_id: &str) -> String {
        format!("transactions:account:{}", sanitize_key(account_id))
    }

    pub fn account_balance(account_id: &str) -> String {
        format!("balance:account:{}", sanitize_key(account_id))
    }

    pub fn transaction(transaction_id: &str) -> String {
        format!("transaction:{}", sanitize_key(transaction_id))
    }

    pub fn invoice(invoice_id: &str) -> String {
        format!("invoice:{}", sanitize_key(invoice_id))
    }

    pub fn customer_invoices(customer_id: &str) -> String {
        format!("invoices:customer:{}", sanitize_key(customer_id))
    }

    pub fn tenant(tenant_id: &str) -> String {
        format!("tenant:{}", sanitize_key(tenant_id))
    }

    pub fn tenant_invoices(tenant_id: &str) -> String {
        format!("invoices:tenant:{}", sanitize_key(tenant_id))
    }

    pub fn tenant_reports(tenant_id: &str) -> String {
        format!("reports:tenant:{}", sanitize_key(tenant_id))
    }

    pub fn tenant_dashboard(tenant_id: &str) -> String {
        format!("dashboard:tenant:{}", sanitize_key(tenant_id))
    }
}

/// Replace characters that could break key structure or act as glob
/// wildcards.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_cache_key_is_deterministic() {
        let mut first = HashMap::new();
        first.insert("to", "2024-12-31");
        first.insert("from", "2024-01-01");
        let mut second = HashMap::new();
        second.insert("from", "2024-01-01");
        second.insert("to", "2024-12-31");

        let a = cache_key("reports:tenant:9:pnl", &first).unwrap();
        let b = cache_key("reports:tenant:9:pnl", &second).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, r#"reports:tenant:9:pnl:{"from":"2024-01-01","to":"2024-12-31"}"#);
    }

    #[test]
    fn test_cache_key_differs_by_arguments() {
        let a = cache_key("balance:user:1", &json!({"currency": "EUR"})).unwrap();
        let b = cache_key("balance:user:1", &json!({"currency": "USD"})).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("balance:user:1:"));
    }

    #[test]
    fn test_rate_limit_key_layout() {
        assert_eq!(
            rate_limit_key("api", "user-42", 1_700_000_040),
            "rate_limit:api:user-42:1700000040"
        );
    }

    #[test]
    fn test_sanitize_key_neutralises_wildcards() {
        assert_eq!(sanitize_key("user*[1]"), "user___1_");
        assert_eq!(sanitize_key("203.0.113.9"), "203.0.113.9");
        assert_eq!(reputation_key("2001:db8::1"), "reputation:ip:2001:db8::1");
    }

    #[test]
    fn test_view_names() {
        assert_eq!(views::user_transactions("7"), "transactions:user:7");
        assert_eq!(views::tenant_reports("acme"), "reports:tenant:acme");
    }

    #[test]
    fn test_view_names_sanitise_ids() {
        assert_eq!(views::tenant_reports("acme corp"), "reports:tenant:acme_corp");
        assert_eq!(views::invoice("2024/07+1"), "invoice:2024_07_1");
        assert_eq!(views::user("*"), "user:_");
    }

    #[test]
    fn test_canonical_ip() {
        assert_eq!(canonical_ip("2001:DB8::1"), "2001:db8::1");
        assert_eq!(canonical_ip("2001:0db8:0000:0000:0000:0000:0000:0001"), "2001:db8::1");
        assert_eq!(canonical_ip("::ffff:203.0.113.9"), "203.0.113.9");
        assert_eq!(canonical_ip(" 198.51.100.4 "), "198.51.100.4");
        assert_eq!(canonical_ip("unknown"), "unknown");
        assert_eq!(reputation_key("2001:DB8::1"), reputation_key("2001:db8::1"));
    }
}
