//! Entity-driven cache invalidation.
//!
//! Each [`EntityChange`] maps to a fixed list of cached views. A view is
//! removed both as an exact key and as the prefix of every cache-aside entry
//! built on it (`<view>:<json args>`). New cached views have to be added to
//! [`patterns_for`] or they will go stale.

use crate::cache::CacheStore;
use crate::key_generator::views;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// A change to a domain entity that invalidates its derived views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityChange {
    User {
        user_id: String,
    },
    Account {
        account_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    Transaction {
        transaction_id: String,
        #[serde(default)]
        account_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    Invoice {
        invoice_id: String,
        #[serde(default)]
        customer_id: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
    },
    Tenant {
        tenant_id: String,
    },
    Report {
        tenant_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Glob(String),
}

impl KeyPattern {
    pub fn as_str(&self) -> &str {
        match self {
            KeyPattern::Exact(key) => key,
            KeyPattern::Glob(pattern) => pattern,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub patterns: Vec<String>,
    pub keys_removed: u64,
}

/// Views cached for `change`, as exact keys and argument-suffixed globs.
pub fn patterns_for(change: &EntityChange) -> Vec<KeyPattern> {
    let mut names: Vec<String> = Vec::new();

    match change {
        EntityChange::User { user_id } => {
            names.push(views::user(user_id));
            names.extend(user_ledger_views(user_id));
        }
        EntityChange::Account {
            account_id,
            user_id,
        } => {
            names.push(views::account(account_id));
            names.push(views::account_transactions(account_id));
            names.push(views::account_balance(account_id));
            if let Some(user_id) = user_id {
                names.push(views::user_balance(user_id));
                names.push(views::user_dashboard(user_id));
            }
        }
        EntityChange::Transaction {
            transaction_id,
            account_id,
            user_id,
        } => {
            names.push(views::transaction(transaction_id));
            if let Some(account_id) = account_id {
                names.push(views::account_transactions(account_id));
                names.push(views::account_balance(account_id));
            }
            if let Some(user_id) = user_id {
                names.extend(user_ledger_views(user_id));
            }
        }
        EntityChange::Invoice {
            invoice_id,
            customer_id,
            tenant_id,
        } => {
            names.push(views::invoice(invoice_id));
            if let Some(customer_id) = customer_id {
                names.push(views::customer_invoices(customer_id));
            }
            if let Some(tenant_id) = tenant_id {
                names.push(views::tenant_invoices(tenant_id));
                names.push(views::tenant_reports(tenant_id));
                names.push(views::tenant_dashboard(tenant_id));
            }
        }
        EntityChange::Tenant { tenant_id } => {
            names.push(views::tenant(tenant_id));
            names.push(views::tenant_invoices(tenant_id));
            names.push(views::tenant_reports(tenant_id));
            names.push(views::tenant_dashboard(tenant_id));
        }
        EntityChange::Report { tenant_id } => {
            names.push(views::tenant_reports(tenant_id));
            names.push(views::tenant_dashboard(tenant_id));
        }
    }

    names
        .into_iter()
        .flat_map(|view| {
            let glob = format!("{}:*", view);
            [KeyPattern::Exact(view), KeyPattern::Glob(glob)]
        })
        .collect()
}

fn user_ledger_views(user_id: &str) -> [String; 3] {
    [
        views::user_transactions(user_id),
        views::user_balance(user_id),
        views::user_dashboard(user_id),
    ]
}

/// Issues the deletes for entity changes against the shared store.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    store: CacheStore,
}

impl CacheInvalidator {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Remove every view derived from `change`. A degraded store removes
    /// nothing and reports zero keys.
    pub async fn invalidate(&self, change: &EntityChange) -> InvalidationReport {
        let patterns = patterns_for(change);
        let mut keys_removed = 0;

        for pattern in &patterns {
            match pattern {
                KeyPattern::Exact(key) => {
                    if self.store.exists(key).await {
                        self.store.del(key).await;
                        keys_removed += 1;
                    }
                }
                KeyPattern::Glob(glob) => {
                    keys_removed += self.store.del_pattern(glob).await;
                }
            }
        }

        debug!(change = ?change, patterns = patterns.len(), "Processed invalidation patterns");
        info!(keys_removed, "Cache invalidated");

        InvalidationReport {
            patterns: patterns.iter().map(ToString::to_string).collect(),
            keys_removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::middleware::CacheAside;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn seeded() -> (CacheInvalidator, CacheStore) {
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        for key in [
            "user:42",
            "transactions:user:42:{\"page\":1}",
            "transactions:user:42:{\"page\":2}",
            "balance:user:42",
            "balance:user:420",
            "dashboard:user:7",
            "account:acc-1",
            "balance:account:acc-1:[\"EUR\"]",
            "invoice:inv-9",
            "invoices:tenant:t1:{}",
            "reports:tenant:t1:{\"year\":2024}",
            "tenant:t1",
        ] {
            store.set(key, "cached", 0).await;
        }
        (CacheInvalidator::new(store.clone()), store)
    }

    #[test]
    fn test_user_patterns() {
        let patterns = patterns_for(&EntityChange::User {
            user_id: "42".to_string(),
        });
        let rendered: Vec<&str> = patterns.iter().map(KeyPattern::as_str).collect();

        assert!(rendered.contains(&"user:42"));
        assert!(rendered.contains(&"user:42:*"));
        assert!(rendered.contains(&"transactions:user:42:*"));
        assert!(rendered.contains(&"balance:user:42:*"));
        assert_eq!(patterns.len(), 8);
    }

    #[test]
    fn test_wildcards_in_ids_are_neutralised() {
        let patterns = patterns_for(&EntityChange::Tenant {
            tenant_id: "*".to_string(),
        });
        assert!(patterns
            .iter()
            .all(|p| !p.as_str().trim_end_matches(":*").contains('*')));
    }

    #[tokio::test]
    async fn test_user_change_cascades_to_ledger_views() {
        let (invalidator, store) = seeded().await;

        let report = invalidator
            .invalidate(&EntityChange::User {
                user_id: "42".to_string(),
            })
            .await;

        assert_eq!(report.keys_removed, 4);
        assert!(!store.exists("user:42").await);
        assert!(!store.exists("transactions:user:42:{\"page\":2}").await);
        assert!(!store.exists("balance:user:42").await);
        // Prefix of a different id is untouched
        assert!(store.exists("balance:user:420").await);
        assert!(store.exists("dashboard:user:7").await);
    }

    #[tokio::test]
    async fn test_transaction_change_without_owner_ids() {
        let (invalidator, store) = seeded().await;

        let report = invalidator
            .invalidate(&EntityChange::Transaction {
                transaction_id: "tx-1".to_string(),
                account_id: None,
                user_id: None,
            })
            .await;

        assert_eq!(report.patterns, vec!["transaction:tx-1", "transaction:tx-1:*"]);
        assert_eq!(report.keys_removed, 0);
        assert!(store.exists("balance:account:acc-1:[\"EUR\"]").await);
    }

    #[tokio::test]
    async fn test_invoice_change_touches_tenant_views() {
        let (invalidator, store) = seeded().await;

        let report = invalidator
            .invalidate(&EntityChange::Invoice {
                invoice_id: "inv-9".to_string(),
                customer_id: Some("c-3".to_string()),
                tenant_id: Some("t1".to_string()),
            })
            .await;

        assert_eq!(report.keys_removed, 3);
        assert!(!store.exists("reports:tenant:t1:{\"year\":2024}").await);
        assert!(store.exists("tenant:t1").await);
    }

    #[tokio::test]
    async fn test_ids_outside_key_alphabet_are_invalidated() {
        let store = CacheStore::new(Arc::new(MemoryBackend::new()));
        let cache = CacheAside::new(store.clone());
        let invalidator = CacheInvalidator::new(store);
        let computed = AtomicUsize::new(0);
        let view = views::tenant_reports("acme corp");
        let quarter = ("q1",);

        let load = || {
            cache.cache_response(&view, &quarter, 300, || async {
                computed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(computed.load(Ordering::SeqCst))
            })
        };

        assert_eq!(load().await.unwrap(), 1);
        assert_eq!(load().await.unwrap(), 1);

        let report = invalidator
            .invalidate(&EntityChange::Report {
                tenant_id: "acme corp".to_string(),
            })
            .await;
        assert_eq!(report.keys_removed, 1);

        assert_eq!(load().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_degraded_store_removes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(backend.clone());
        store.set("tenant:t1", "cached", 0).await;
        backend.set_connected(false);

        let report = CacheInvalidator::new(store)
            .invalidate(&EntityChange::Tenant {
                tenant_id: "t1".to_string(),
            })
            .await;

        assert_eq!(report.keys_removed, 0);
        assert_eq!(report.patterns.len(), 8);
    }

    #[test]
    fn test_change_deserialization() {
        let change: EntityChange =
            serde_json::from_str(r#"{"entity": "account", "account_id": "acc-1"}"#).unwrap();
        assert_eq!(
            change,
            EntityChange::Account {
                account_id: "acc-1".to_string(),
                user_id: None
            }
        );
        assert!(serde_json::from_str::<EntityChange>(r#"{"entity": "ledger"}"#).is_err());
    }
}
