use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::ChannelId;

pub const CHANNEL_SCOPE_PREFIX: &str = "channel:";

/// Claims carried by a channel access token.
///
/// Minted when a pairing is approved; presented by clients when they
/// authenticate a connection. `scopes` lists the channels the holder
/// may subscribe to, as `channel:<org>:<line>` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn allows_channel(&self, channel: &ChannelId) -> bool {
        let wanted = channel.scope();
        self.scopes.iter().any(|scope| scope == &wanted)
    }
}

/// Claims carried by a short-lived quick-pair token.
///
/// `sid` binds the token to the session it was minted for; a token
/// presented against a different session id is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingTokenClaims {
    pub sid: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token signature or format is invalid: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("token is not scoped to channel {0}")]
    MissingScope(String),
    #[error("failed to encode token: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

/// Mints and verifies the HS256 tokens used by both pairing flows.
///
/// Both the issuing and verifying side live in the same process, so a
/// single shared secret stands in for a key-distribution layer.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Mint an access token scoped to a single channel.
    pub fn mint_channel_token(
        &self,
        subject: &str,
        channel: &ChannelId,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        let claims = AccessTokenClaims {
            sub: subject.to_string(),
            scopes: vec![channel.scope()],
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Encode)
    }

    /// Mint a quick-pair token binding a session id to a subject.
    pub fn mint_pairing_token(
        &self,
        session_id: &str,
        subject: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        let claims = PairingTokenClaims {
            sid: session_id.to_string(),
            sub: subject.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Encode)
    }

    /// Verify an access token and check it is scoped to `channel`.
    pub fn verify_channel_token(
        &self,
        token: &str,
        channel: &ChannelId,
    ) -> Result<AccessTokenClaims, TokenError> {
        let claims: AccessTokenClaims = self.decode(token)?;
        if !claims.allows_channel(channel) {
            return Err(TokenError::MissingScope(channel.scope()));
        }
        Ok(claims)
    }

    /// Verify a quick-pair token's signature and expiry.
    ///
    /// Session-id matching is the caller's concern; it needs to
    /// distinguish a mismatch from an invalid token.
    pub fn verify_pairing_token(&self, token: &str) -> Result<PairingTokenClaims, TokenError> {
        self.decode(token)
    }

    fn decode<C: serde::de::DeserializeOwned>(&self, token: &str) -> Result<C, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        match decode::<C>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                _ => Err(TokenError::Invalid(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(b"test-secret")
    }

    fn channel() -> ChannelId {
        ChannelId::parse("acme:line-1").unwrap()
    }

    #[test]
    fn channel_token_round_trip() {
        let issuer = issuer();
        let token = issuer
            .mint_channel_token("user-1", &channel(), Duration::hours(12))
            .unwrap();
        let claims = issuer.verify_channel_token(&token, &channel()).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.allows_channel(&channel()));
    }

    #[test]
    fn rejects_wrong_channel_scope() {
        let issuer = issuer();
        let token = issuer
            .mint_channel_token("user-1", &channel(), Duration::hours(12))
            .unwrap();
        let other = ChannelId::parse("acme:line-2").unwrap();
        assert!(matches!(
            issuer.verify_channel_token(&token, &other),
            Err(TokenError::MissingScope(_))
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let issuer = issuer();
        let token = issuer
            .mint_channel_token("user-1", &channel(), Duration::seconds(-120))
            .unwrap();
        assert!(matches!(
            issuer.verify_channel_token(&token, &channel()),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn rejects_tampered_signature() {
        let issuer = issuer();
        let other = TokenIssuer::new(b"different-secret");
        let token = other
            .mint_channel_token("user-1", &channel(), Duration::hours(1))
            .unwrap();
        assert!(matches!(
            issuer.verify_channel_token(&token, &channel()),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn pairing_token_round_trip() {
        let issuer = issuer();
        let token = issuer
            .mint_pairing_token("AB12CD34", "mobile-7", Duration::minutes(15))
            .unwrap();
        let claims = issuer.verify_pairing_token(&token).unwrap();
        assert_eq!(claims.sid, "AB12CD34");
        assert_eq!(claims.sub, "mobile-7");
    }
}
