//! Session token claims and the roles they grant.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Role tag carried in the `t` claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleTag {
    /// Upload scoped to a name and a storage provider.
    #[serde(rename = "u")]
    Upload,
    /// Member of the download broadcast group.
    #[serde(rename = "d")]
    Download,
}

impl RoleTag {
    /// Parse from the CLI spelling (`upload` / `download`) or the claim tag.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "u" | "upload" => Ok(Self::Upload),
            "d" | "download" => Ok(Self::Download),
            _ => Err(Error::InvalidToken(format!("unknown role: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "u",
            Self::Download => "d",
        }
    }
}

impl fmt::Display for RoleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verified payload of a signed session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub t: RoleTag,
    /// Scope name for upload tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// Storage provider id for upload tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    /// Expiry as a unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl TokenClaims {
    pub fn upload(name: impl Into<String>, storage_provider_id: impl Into<String>) -> Self {
        Self {
            t: RoleTag::Upload,
            n: Some(name.into()),
            s: Some(storage_provider_id.into()),
            exp: None,
        }
    }

    pub fn download() -> Self {
        Self {
            t: RoleTag::Download,
            n: None,
            s: None,
            exp: None,
        }
    }

    /// Check the expiry claim, if any.
    pub fn is_expired(&self) -> bool {
        match self.exp {
            Some(exp) => OffsetDateTime::now_utc().unix_timestamp() > exp,
            None => false,
        }
    }

    /// Resolve the session role, rejecting incomplete upload claims.
    pub fn role(&self) -> Result<SessionRole> {
        if self.is_expired() {
            return Err(Error::InvalidToken("token expired".to_string()));
        }
        match self.t {
            RoleTag::Upload => {
                let name = self
                    .n
                    .as_deref()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| Error::InvalidToken("upload token without name".to_string()))?;
                let storage_provider_id = self.s.as_deref().filter(|s| !s.is_empty()).ok_or_else(
                    || Error::InvalidToken("upload token without storage provider".to_string()),
                )?;
                Ok(SessionRole::Upload {
                    name: name.to_string(),
                    storage_provider_id: storage_provider_id.to_string(),
                })
            }
            RoleTag::Download => Ok(SessionRole::Download),
        }
    }
}

/// Role of an authenticated duplex session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Upload {
        name: String,
        storage_provider_id: String,
    },
    Download,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload { .. } => "upload",
            Self::Download => "download",
        }
    }
}
