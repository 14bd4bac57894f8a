//! Authentication: user bearer JWTs, hashed API keys, agent tokens, and
//! sandbox ownership checks.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared_types::Tier;
use uuid::Uuid;

use crate::db::{Credential, Db, SandboxRow};
use crate::error::{Error, Result};

/// `isk_` + 64 hex chars.
pub const KEY_LENGTH: usize = 68;
/// Lookup prefix: `isk_` + first 8 hex chars.
pub const KEY_PREFIX_LENGTH: usize = 12;

const AGENT_TOKEN_LIFETIME_HOURS: i64 = 24;

/// Identity established by a successful API-key verification.
#[derive(Debug, Clone)]
pub struct KeyIdentity {
    pub user_id: Uuid,
    pub credential_id: Uuid,
    pub email: String,
}

/// Identity established by a user bearer JWT.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserClaims {
    #[serde(rename = "userId")]
    user_id: Uuid,
    email: String,
    exp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentTokenKind {
    /// The agent process of a provisioned sandbox.
    Agent,
    /// A pre-warmed pool container not yet bound to a user.
    Warm,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentClaims {
    #[serde(rename = "sandboxId")]
    pub sandbox_id: Uuid,
    #[serde(rename = "type")]
    pub kind: AgentTokenKind,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub exp: usize,
}

/// Shape check for a presented API key: `isk_` + 64 lowercase hex.
pub fn is_valid_key_format(key: &str) -> bool {
    key.len() == KEY_LENGTH
        && key.starts_with("isk_")
        && key[4..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

pub fn key_prefix(key: &str) -> &str {
    &key[..KEY_PREFIX_LENGTH]
}

/// Mint a fresh API key: returns `(full_key, prefix, bcrypt_hash)`. The full
/// key is shown exactly once; only prefix and hash are stored.
pub fn generate_api_key() -> anyhow::Result<(String, String, String)> {
    use rand::RngCore;
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    let key = format!("isk_{}", hex::encode(raw));
    let prefix = key_prefix(&key).to_string();
    let hash = bcrypt::hash(&key, bcrypt::DEFAULT_COST)?;
    Ok((key, prefix, hash))
}

/// Hash-check a presented key against every candidate row. Every candidate
/// is checked even after a match so timing does not reveal which row won.
pub fn match_candidates<'a>(key: &str, candidates: &'a [Credential]) -> Option<&'a Credential> {
    let mut matched = None;
    for candidate in candidates {
        if bcrypt::verify(key, &candidate.key_hash).unwrap_or(false) && matched.is_none() {
            matched = Some(candidate);
        }
    }
    matched
}

#[derive(Clone)]
pub struct AuthGate {
    db: Db,
    jwt_secret: String,
}

impl AuthGate {
    pub fn new(db: Db, jwt_secret: String) -> Self {
        Self { db, jwt_secret }
    }

    /// Verify a user bearer JWT and load the user it names.
    pub async fn verify_user_bearer(&self, token: &str) -> Result<UserIdentity> {
        let claims = decode::<UserClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| Error::Unauthenticated("invalid bearer token".into()))?
        .claims;

        let user = self
            .db
            .get_user(claims.user_id)
            .await?
            .ok_or_else(|| Error::Unauthenticated("invalid bearer token".into()))?;

        Ok(UserIdentity {
            user_id: user.id,
            email: user.email,
        })
    }

    /// Verify an API key: shape check, prefix lookup, then a constant-time
    /// hash compare per candidate. Touches last-used-at on the winner.
    pub async fn verify_api_key(&self, key: &str) -> Result<KeyIdentity> {
        if !is_valid_key_format(key) {
            return Err(Error::Unauthenticated("invalid credentials".into()));
        }

        let candidates = self.db.get_credentials_by_prefix(key_prefix(key)).await?;
        let credential = match_candidates(key, &candidates)
            .ok_or_else(|| Error::Unauthenticated("invalid credentials".into()))?;

        let user = self
            .db
            .get_user(credential.user_id)
            .await?
            .ok_or_else(|| Error::Unauthenticated("invalid credentials".into()))?;

        self.db.touch_credential_last_used(credential.id).await?;

        Ok(KeyIdentity {
            user_id: credential.user_id,
            credential_id: credential.id,
            email: user.email,
        })
    }

    /// Ownership check. A miss is reported as not-found so callers cannot
    /// probe for foreign sandbox ids.
    pub fn authorize_sandbox(&self, sandbox: &SandboxRow, user_id: Uuid) -> Result<()> {
        if sandbox.user_id != user_id {
            return Err(Error::NotFound("sandbox not found".into()));
        }
        Ok(())
    }

    /// Mint the JWT injected into a sandbox container for its agent.
    pub fn mint_agent_token(
        &self,
        sandbox_id: Uuid,
        kind: AgentTokenKind,
        user_id: Option<Uuid>,
        tier: Option<Tier>,
    ) -> Result<String> {
        let claims = AgentClaims {
            sandbox_id,
            kind,
            user_id,
            tier,
            exp: (Utc::now() + chrono::Duration::hours(AGENT_TOKEN_LIFETIME_HOURS)).timestamp()
                as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to sign agent token: {e}")))
    }

    /// Verify an agent token presented on the agent WebSocket. The sandbox
    /// id in the URL must match the one in the payload.
    pub fn verify_agent_token(&self, token: &str, expected_sandbox: Uuid) -> Result<AgentClaims> {
        let claims = decode::<AgentClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| Error::Unauthenticated("invalid agent token".into()))?
        .claims;

        if claims.sandbox_id != expected_sandbox {
            return Err(Error::Unauthenticated("agent token sandbox mismatch".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn key_format_rejects_malformed_input() {
        let good = format!("isk_{}", "a".repeat(64));
        assert!(is_valid_key_format(&good));

        assert!(!is_valid_key_format("isk_short"));
        assert!(!is_valid_key_format(&format!("sk_{}", "a".repeat(65))));
        assert!(!is_valid_key_format(&format!("isk_{}", "A".repeat(64))));
        assert!(!is_valid_key_format(&format!("isk_{}", "z".repeat(64))));
    }

    #[test]
    fn prefix_is_first_twelve_chars() {
        let key = format!("isk_{}", "0123456789abcdef".repeat(4));
        assert_eq!(key_prefix(&key), "isk_01234567");
    }

    #[test]
    fn generated_keys_verify_against_their_hash() {
        let (key, prefix, hash) = generate_api_key().unwrap();
        assert!(is_valid_key_format(&key));
        assert_eq!(prefix, key_prefix(&key));
        assert!(bcrypt::verify(&key, &hash).unwrap());
    }

    fn credential_with_hash(key: &str) -> Credential {
        Credential {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            key_prefix: key_prefix(key).to_string(),
            // Cost 4 keeps the test fast; production hashing uses DEFAULT_COST.
            key_hash: bcrypt::hash(key, 4).unwrap(),
            name: "test".into(),
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
        }
    }

    #[test]
    fn prefix_collisions_resolve_by_hash() {
        let key_a = format!("isk_01234567{}", "a".repeat(56));
        let key_b = format!("isk_01234567{}", "b".repeat(56));
        assert_eq!(key_prefix(&key_a), key_prefix(&key_b));

        let candidates = vec![credential_with_hash(&key_a), credential_with_hash(&key_b)];
        let matched = match_candidates(&key_b, &candidates).unwrap();
        assert_eq!(matched.id, candidates[1].id);
        assert!(match_candidates(&format!("isk_01234567{}", "c".repeat(56)), &candidates).is_none());
    }

    #[tokio::test]
    async fn agent_token_roundtrip_and_mismatch() {
        // AuthGate::new needs a Db; token paths never touch it, so a gate
        // built for token tests uses a lazily-connecting pool.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let gate = AuthGate::new(crate::db::Db::new(pool), "test-secret".into());

        let sandbox_id = Uuid::new_v4();
        let token = gate
            .mint_agent_token(sandbox_id, AgentTokenKind::Agent, Some(Uuid::new_v4()), Some(Tier::Pro))
            .unwrap();

        let claims = gate.verify_agent_token(&token, sandbox_id).unwrap();
        assert_eq!(claims.sandbox_id, sandbox_id);
        assert_eq!(claims.kind, AgentTokenKind::Agent);
        assert_eq!(claims.tier, Some(Tier::Pro));

        let other = Uuid::new_v4();
        assert!(gate.verify_agent_token(&token, other).is_err());
        assert!(gate.verify_agent_token("garbage", sandbox_id).is_err());
    }
}
