//! Bearer-token verification. Tokens are minted by an external identity
//! provider; this layer only maps a presented token to a user and role.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::Member => f.write_str("member"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Local single-user session used when no verifier is configured.
    pub fn local() -> Self {
        Self {
            user_id: "local".to_string(),
            role: Role::Admin,
        }
    }
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> anyhow::Result<Session>;
}

/// Token table loaded from JSON: `{ "<token>": { "user_id": "...", "role": "member" } }`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: BTreeMap<String, Session>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: BTreeMap<String, Session>) -> Self {
        Self { tokens }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading token table {}", path.display()))?;
        let tokens: BTreeMap<String, Session> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid token table {}", path.display()))?;
        Ok(Self::new(tokens))
    }

    pub fn insert(&mut self, token: impl Into<String>, session: Session) {
        self.tokens.insert(token.into(), session);
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> anyhow::Result<Session> {
        match self.tokens.get(token.trim()) {
            Some(session) if !session.user_id.trim().is_empty() => Ok(session.clone()),
            _ => bail!("invalid or expired token"),
        }
    }
}

pub fn parse_bearer(header: &str) -> Option<&str> {
    let trimmed = header.trim();
    let (scheme, token) = trimmed.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

pub fn authorize(verifier: &dyn TokenVerifier, header: Option<&str>) -> anyhow::Result<Session> {
    let Some(token) = header.and_then(parse_bearer) else {
        bail!("missing bearer token");
    };
    verifier.verify(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> StaticTokenVerifier {
        let mut verifier = StaticTokenVerifier::default();
        verifier.insert(
            "tok-ada",
            Session {
                user_id: "ada".to_string(),
                role: Role::Member,
            },
        );
        verifier
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("  bearer   abc  "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }

    #[test]
    fn authorize_maps_token_to_session() -> anyhow::Result<()> {
        let session = authorize(&verifier(), Some("Bearer tok-ada"))?;
        assert_eq!(session.user_id, "ada");
        assert!(!session.is_admin());
        Ok(())
    }

    #[test]
    fn authorize_rejects_missing_and_unknown_tokens() {
        let missing = authorize(&verifier(), None).err().map(|err| err.to_string());
        assert_eq!(missing.as_deref(), Some("missing bearer token"));

        let unknown = authorize(&verifier(), Some("Bearer nope"))
            .err()
            .map(|err| err.to_string());
        assert_eq!(unknown.as_deref(), Some("invalid or expired token"));
    }

    #[test]
    fn token_table_loads_from_json() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tokens.json");
        std::fs::write(
            &path,
            r#"{"tok-1": {"user_id": "grace", "role": "admin"}}"#,
        )?;
        let verifier = StaticTokenVerifier::load(&path)?;
        let session = verifier.verify("tok-1")?;
        assert_eq!(session.user_id, "grace");
        assert_eq!(session.role, Role::Admin);
        Ok(())
    }
}
