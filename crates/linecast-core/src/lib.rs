mod token;

pub use token::{
    AccessTokenClaims, PairingTokenClaims, TokenError, TokenIssuer, CHANNEL_SCOPE_PREFIX,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a broadcast channel, shaped as `<org>:<line>`.
///
/// Channels have no record of their own; the id is just the key the
/// broadcaster groups subscribers under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelIdError {
    #[error("channel id must not be empty")]
    Empty,
    #[error("channel id must be shaped as <org>:<line>")]
    MissingSeparator,
}

impl ChannelId {
    pub fn new(org: &str, line: &str) -> Result<Self, ChannelIdError> {
        if org.trim().is_empty() || line.trim().is_empty() {
            return Err(ChannelIdError::Empty);
        }
        Ok(Self(format!("{}:{}", org.trim(), line.trim())))
    }

    pub fn parse(raw: &str) -> Result<Self, ChannelIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChannelIdError::Empty);
        }
        match trimmed.split_once(':') {
            Some((org, line)) if !org.is_empty() && !line.is_empty() => {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(ChannelIdError::MissingSeparator),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn org(&self) -> &str {
        self.0.split_once(':').map(|(org, _)| org).unwrap_or("")
    }

    pub fn line(&self) -> &str {
        self.0.split_once(':').map(|(_, line)| line).unwrap_or("")
    }

    /// Scope string a token must carry to use this channel.
    pub fn scope(&self) -> String {
        format!("{}{}", CHANNEL_SCOPE_PREFIX, self.0)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ChannelIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChannelId::parse(&value)
    }
}

impl From<ChannelId> for String {
    fn from(value: ChannelId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_org_line_shape() {
        let id = ChannelId::parse("acme:line-7").unwrap();
        assert_eq!(id.org(), "acme");
        assert_eq!(id.line(), "line-7");
        assert_eq!(id.as_str(), "acme:line-7");
        assert_eq!(id.scope(), "channel:acme:line-7");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(ChannelId::parse(""), Err(ChannelIdError::Empty));
        assert_eq!(ChannelId::parse("   "), Err(ChannelIdError::Empty));
        assert_eq!(
            ChannelId::parse("no-separator"),
            Err(ChannelIdError::MissingSeparator)
        );
        assert_eq!(
            ChannelId::parse(":line"),
            Err(ChannelIdError::MissingSeparator)
        );
        assert_eq!(
            ChannelId::parse("org:"),
            Err(ChannelIdError::MissingSeparator)
        );
    }

    #[test]
    fn new_trims_components() {
        let id = ChannelId::new(" acme ", "line-1").unwrap();
        assert_eq!(id.as_str(), "acme:line-1");
        assert_eq!(ChannelId::new("", "line-1"), Err(ChannelIdError::Empty));
    }
}
