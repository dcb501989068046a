use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fs;
use uuid::Uuid;

use super::GatewayError;
use crate::config::{JwtConfig, SigningKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by both token kinds.
///
/// Roles are deliberately absent: they are resolved from the identity store
/// when a request is authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (identity ID)
    pub sub: Uuid,
    /// Token family ID, shared by every pair rotated from one issuance
    pub fam: Uuid,
    /// Unique token ID, the revocation key
    pub jti: Uuid,
    pub typ: TokenKind,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Token signing and decoding.
#[derive(Clone)]
pub struct JwtService {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

impl JwtService {
    /// Build from an HS256 secret or RS256 PEM files.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let (algorithm, encoding_key, decoding_key) = match &config.signing_key {
            SigningKey::Secret(secret) => {
                tracing::info!("JWT service initialized with HS256 secret");
                (
                    Algorithm::HS256,
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            SigningKey::RsaPemFiles {
                private_key_path,
                public_key_path,
            } => {
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                tracing::info!("JWT service initialized with RS256 keys");
                (Algorithm::RS256, encoding_key, decoding_key)
            }
        };

        Ok(Self {
            algorithm,
            encoding_key,
            decoding_key,
            issuer: config.issuer.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
        })
    }

    pub fn access_claims(&self, subject: Uuid, family: Uuid) -> Claims {
        self.claims(subject, family, Uuid::new_v4(), TokenKind::Access)
    }

    pub fn refresh_claims(&self, subject: Uuid, family: Uuid, jti: Uuid) -> Claims {
        self.claims(subject, family, jti, TokenKind::Refresh)
    }

    fn claims(&self, subject: Uuid, family: Uuid, jti: Uuid, typ: TokenKind) -> Claims {
        let now = Utc::now();
        let lifetime = match typ {
            TokenKind::Access => Duration::minutes(self.access_token_expiry_minutes),
            TokenKind::Refresh => Duration::days(self.refresh_token_expiry_days),
        };
        Claims {
            sub: subject,
            fam: family,
            jti,
            typ,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
        }
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, GatewayError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("Failed to encode token: {}", e)))
    }

    /// Check signature, issuer, expiry and kind. Liveness is not checked here.
    pub fn decode(&self, token: &str, expected: TokenKind) -> Result<Claims, GatewayError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
                _ => GatewayError::TokenInvalid,
            })?
            .claims;

        if claims.typ != expected {
            return Err(GatewayError::TokenInvalid);
        }
        Ok(claims)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_seconds(&self) -> i64 {
        self.refresh_token_expiry_days * 24 * 60 * 60
    }
}
