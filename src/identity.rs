//! Identity minting.
//!
//! The authority is external. When it errors or stalls, the pipeline
//! substitutes a locally derived identifier instead of blocking.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::IdentityError;

/// Issues identifiers for entities (e.g. intake records).
#[async_trait]
pub trait IdentityMinter: Send + Sync {
    async fn mint(&self, entity_type: &str) -> Result<String, IdentityError>;
}

/// Mints random identifiers in-process.
pub struct LocalMinter {
    node_id: String,
}

impl LocalMinter {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl IdentityMinter for LocalMinter {
    async fn mint(&self, entity_type: &str) -> Result<String, IdentityError> {
        Ok(format!(
            "{entity_type}-{}-{}",
            self.node_id,
            Uuid::new_v4().simple()
        ))
    }
}

/// A minted identifier and whether it came from the fallback path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintedId {
    pub id: String,
    pub is_fallback: bool,
}

/// Deterministic local identifier for `seed` (usually a message id).
pub fn fallback_identifier(entity_type: &str, node_id: &str, seed: &str) -> String {
    let name = format!("{entity_type}/{node_id}/{seed}");
    let derived = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
    format!("local-{entity_type}-{}", derived.simple())
}

/// Mint through the authority within `timeout`, or fall back.
pub async fn mint_or_fallback(
    minter: &dyn IdentityMinter,
    entity_type: &str,
    node_id: &str,
    seed: &str,
    timeout: Duration,
) -> MintedId {
    let err = match tokio::time::timeout(timeout, minter.mint(entity_type)).await {
        Ok(Ok(id)) => {
            return MintedId {
                id,
                is_fallback: false,
            };
        }
        Ok(Err(e)) => e,
        Err(_) => IdentityError::Timeout(timeout),
    };
    let id = fallback_identifier(entity_type, node_id, seed);
    warn!(entity_type, error = %err, fallback = %id, "Identity mint failed, using local identifier");
    MintedId {
        id,
        is_fallback: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl IdentityMinter for Failing {
        async fn mint(&self, entity_type: &str) -> Result<String, IdentityError> {
            Err(IdentityError::MintFailed {
                entity_type: entity_type.into(),
                reason: "ledger offline".into(),
            })
        }
    }

    struct Stalled;

    #[async_trait]
    impl IdentityMinter for Stalled {
        async fn mint(&self, _entity_type: &str) -> Result<String, IdentityError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn local_minter_succeeds() {
        let m = mint_or_fallback(&LocalMinter::new("n1"), "intake", "n1", "msg", Duration::from_secs(1)).await;
        assert!(!m.is_fallback);
        assert!(m.id.starts_with("intake-n1-"));
    }

    #[tokio::test]
    async fn failure_falls_back_deterministically() {
        let a = mint_or_fallback(&Failing, "intake", "n1", "msg-1", Duration::from_secs(1)).await;
        let b = mint_or_fallback(&Failing, "intake", "n1", "msg-1", Duration::from_secs(1)).await;
        assert!(a.is_fallback);
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("local-intake-"));
        assert_ne!(a.id, fallback_identifier("intake", "n1", "msg-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_times_out() {
        let m = mint_or_fallback(&Stalled, "intake", "n1", "m", Duration::from_secs(2)).await;
        assert!(m.is_fallback);
    }
}
