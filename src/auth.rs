//! Credential resolution (§4.4/§9). Two token shapes share one seam, distinguished purely by
//! prefix the way the teacher's settings handler keys administrative API keys off a fixed-length
//! prefix: legacy opaque `sk_*`/`pk_*` tokens resolved through the OLTP `credentials` table, and
//! self-describing `<base64url(payload)>.<hex(hmac)>` tokens validated by signature alone.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::AppError;
use crate::oltp_store::OltpStore;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialEnvironment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub environment: CredentialEnvironment,
    pub scopes: Vec<String>,
    /// `pk_*` tokens carry origin restrictions, enforced by CORS middleware (§4.4).
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SelfDescribingClaim {
    tenant_id: Uuid,
    project_id: Uuid,
    environment: CredentialEnvironment,
    scopes: Vec<String>,
}

impl Serialize for CredentialEnvironment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = match self {
            CredentialEnvironment::Dev => "dev",
            CredentialEnvironment::Prod => "prod",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for CredentialEnvironment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "dev" => Ok(CredentialEnvironment::Dev),
            "prod" => Ok(CredentialEnvironment::Prod),
            other => Err(serde::de::Error::custom(format!("unknown environment `{other}`"))),
        }
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `resolveCredential(token) -> (tenant_id, project_id, env, scopes)` (§4.4 step 1).
pub async fn resolve_credential(
    token: &str,
    signing_secret: &str,
    oltp: &OltpStore,
) -> Result<ResolvedCredential, AppError> {
    if token.starts_with("sk_") || token.starts_with("pk_") {
        return resolve_legacy(token, oltp);
    }
    resolve_self_describing(token, signing_secret)
}

fn resolve_legacy(token: &str, oltp: &OltpStore) -> Result<ResolvedCredential, AppError> {
    let hash = hash_token(token);
    let row = oltp
        .lookup_credential(&hash)
        .map_err(|_| AppError::DownstreamUnavailable("credential lookup".to_string()))?
        .ok_or(AppError::Unauthenticated)?;

    let tenant_id = row.tenant_id.parse().map_err(|_| AppError::Unauthenticated)?;
    let project_id = row.project_id.parse().map_err(|_| AppError::Unauthenticated)?;
    let environment = match row.environment.as_str() {
        "prod" => CredentialEnvironment::Prod,
        _ => CredentialEnvironment::Dev,
    };
    let scopes = row.scopes.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
    let allowed_origins = if token.starts_with("pk_") {
        Some(
            row.allowed_origins
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else {
        None
    };

    Ok(ResolvedCredential {
        tenant_id,
        project_id,
        environment,
        scopes,
        allowed_origins,
    })
}

fn resolve_self_describing(token: &str, signing_secret: &str) -> Result<ResolvedCredential, AppError> {
    let (payload_b64, signature_hex) = token.split_once('.').ok_or(AppError::Unauthenticated)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Unauthenticated)?;

    let expected = compute_hmac(signing_secret, &payload_bytes);
    if !constant_time_eq(expected.as_bytes(), signature_hex.as_bytes()) {
        return Err(AppError::Unauthenticated);
    }

    let claim: SelfDescribingClaim =
        serde_json::from_slice(&payload_bytes).map_err(|_| AppError::Unauthenticated)?;

    Ok(ResolvedCredential {
        tenant_id: claim.tenant_id,
        project_id: claim.project_id,
        environment: claim.environment,
        scopes: claim.scopes,
        allowed_origins: None,
    })
}

/// Signs a claim for test fixtures and the (out-of-scope-for-HTTP) credential-issuance path.
pub fn sign_claim(
    tenant_id: Uuid,
    project_id: Uuid,
    environment: CredentialEnvironment,
    scopes: Vec<String>,
    signing_secret: &str,
) -> String {
    let claim = SelfDescribingClaim {
        tenant_id,
        project_id,
        environment,
        scopes,
    };
    let payload = serde_json::to_vec(&claim).expect("claim always serializes");
    let signature = compute_hmac(signing_secret, &payload);
    format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), signature)
}

fn compute_hmac(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_describing_round_trips() {
        let tenant_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let secret = "test-secret";
        let token = sign_claim(
            tenant_id,
            project_id,
            CredentialEnvironment::Prod,
            vec!["ingest".to_string()],
            secret,
        );

        let resolved = resolve_self_describing(&token, secret).unwrap();
        assert_eq!(resolved.tenant_id, tenant_id);
        assert_eq!(resolved.project_id, project_id);
        assert_eq!(resolved.environment, CredentialEnvironment::Prod);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let secret = "test-secret";
        let token = sign_claim(Uuid::new_v4(), Uuid::new_v4(), CredentialEnvironment::Dev, vec![], secret);
        let mut tampered = token.clone();
        tampered.push('0');
        assert!(resolve_self_describing(&tampered, secret).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = sign_claim(Uuid::new_v4(), Uuid::new_v4(), CredentialEnvironment::Dev, vec![], "secret-a");
        assert!(resolve_self_describing(&token, "secret-b").is_err());
    }
}
