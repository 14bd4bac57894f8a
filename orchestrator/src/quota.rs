//! Pre-create admission checks.
//!
//! Counts read from the persistent store inside the same request; no
//! distributed locking, so concurrent creates may briefly over-admit. The
//! ordering user → credential → system bounds that drift.

use shared_types::Tier;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Db;
use crate::error::{Error, QuotaScope, Result};

#[derive(Clone)]
pub struct QuotaManager {
    db: Db,
    per_credential_cap: i64,
    system_cap: i64,
    tier_caps: [(Tier, i64); 3],
}

/// Snapshot returned by the quota-usage endpoint.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub user_active: i64,
    pub credential_active: i64,
    pub global_active: i64,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCaps {
    pub max_sandboxes: i64,
    pub max_per_credential: i64,
    pub max_global: i64,
}

impl QuotaManager {
    pub fn new(db: Db, config: &Config) -> Self {
        Self {
            db,
            per_credential_cap: config.max_sandboxes_per_key,
            system_cap: config.max_sandboxes_global,
            tier_caps: config.tier_max_sandboxes,
        }
    }

    fn tier_cap(&self, tier: Tier) -> i64 {
        self.tier_caps
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, cap)| *cap)
            .unwrap_or_else(|| tier.limits().max_sandboxes)
    }

    /// Admit or reject a create request. Checked in order: per-user tier
    /// cap, per-credential cap, system cap.
    pub async fn check_admission(
        &self,
        user_id: Uuid,
        credential_id: Uuid,
        tier: Tier,
    ) -> Result<()> {
        let user_cap = self.tier_cap(tier);
        let user_active = self.db.count_active_by_user(user_id).await?;
        if user_active >= user_cap {
            return Err(Error::QuotaExceeded {
                scope: QuotaScope::User,
                limit: user_cap,
            });
        }

        let credential_active = self.db.count_active_by_credential(credential_id).await?;
        if credential_active >= self.per_credential_cap {
            return Err(Error::QuotaExceeded {
                scope: QuotaScope::Credential,
                limit: self.per_credential_cap,
            });
        }

        let global_active = self.db.count_active_global().await?;
        if global_active >= self.system_cap {
            return Err(Error::QuotaExceeded {
                scope: QuotaScope::System,
                limit: self.system_cap,
            });
        }

        Ok(())
    }

    pub async fn usage(&self, user_id: Uuid, credential_id: Uuid) -> Result<QuotaUsage> {
        Ok(QuotaUsage {
            user_active: self.db.count_active_by_user(user_id).await?,
            credential_active: self.db.count_active_by_credential(credential_id).await?,
            global_active: self.db.count_active_global().await?,
        })
    }

    pub fn caps(&self, tier: Tier) -> QuotaCaps {
        QuotaCaps {
            max_sandboxes: self.tier_cap(tier),
            max_per_credential: self.per_credential_cap,
            max_global: self.system_cap,
        }
    }
}
