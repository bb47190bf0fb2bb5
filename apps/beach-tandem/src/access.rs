use std::collections::HashSet;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::room::RoomKey;

/// Who a connection acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    /// Bearer token presented on connect, forwarded to remote access checks.
    pub token: Option<String>,
}

impl Principal {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("missing access token")]
    MissingToken,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
    #[error("no read access to {0}")]
    Forbidden(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("access check unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AccessError>;

    /// Read access to the record a room edits.
    async fn authorize(&self, principal: &Principal, key: &RoomKey) -> Result<(), AccessError>;
}

#[derive(Debug, Deserialize)]
struct PrincipalClaims {
    sub: String,
}

/// Bearer tokens resolved locally; record access optionally checked against the item API.
pub struct TokenAccess {
    secret: Option<DecodingKey>,
    remote: Option<RemoteAccess>,
}

impl TokenAccess {
    /// Without a secret the raw token is taken as the user id.
    pub fn new(secret: Option<&str>, remote: Option<RemoteAccess>) -> Self {
        Self {
            secret: secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            remote,
        }
    }
}

#[async_trait]
impl AccessControl for TokenAccess {
    async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AccessError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AccessError::MissingToken)?;

        let user = match &self.secret {
            Some(key) => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.required_spec_claims.clear();
                let data = decode::<PrincipalClaims>(token, key, &validation)?;
                data.claims.sub
            }
            None => token.to_string(),
        };
        if user.trim().is_empty() {
            return Err(AccessError::MissingSubject);
        }
        Ok(Principal {
            user,
            token: Some(token.to_string()),
        })
    }

    async fn authorize(&self, principal: &Principal, key: &RoomKey) -> Result<(), AccessError> {
        match &self.remote {
            Some(remote) => remote.check(principal, key).await,
            None => Ok(()),
        }
    }
}

/// Asks the item API whether the caller may read a record.
pub struct RemoteAccess {
    base_url: String,
    client: Client,
}

impl RemoteAccess {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn item_url(&self, key: &RoomKey) -> String {
        match &key.item {
            Some(item) => format!("{}/items/{}/{}", self.base_url, key.collection, item),
            None => format!("{}/items/{}", self.base_url, key.collection),
        }
    }

    async fn check(&self, principal: &Principal, key: &RoomKey) -> Result<(), AccessError> {
        let mut request = self.client.get(self.item_url(key));
        if let Some(version) = &key.version {
            request = request.query(&[("version", version)]);
        }
        if let Some(token) = &principal.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| AccessError::Unavailable(err.to_string()))?;
        let status = response.status();
        debug!(user = %principal.user, record = %key.display_name(), %status, "remote access check");
        match status {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AccessError::Forbidden(key.display_name()))
            }
            StatusCode::NOT_FOUND => Err(AccessError::NotFound(key.display_name())),
            other => Err(AccessError::Unavailable(format!("item api returned {other}"))),
        }
    }
}

/// Fixed rules, for wiring nodes together in tests and local runs.
#[derive(Debug, Default)]
pub struct StaticAccess {
    forbidden: HashSet<String>,
    missing: HashSet<(String, Option<String>)>,
}

impl StaticAccess {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn forbid_collection(mut self, collection: impl Into<String>) -> Self {
        self.forbidden.insert(collection.into());
        self
    }

    pub fn missing_item(mut self, collection: impl Into<String>, item: Option<&str>) -> Self {
        self.missing
            .insert((collection.into(), item.map(str::to_string)));
        self
    }
}

#[async_trait]
impl AccessControl for StaticAccess {
    async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AccessError> {
        let user = token
            .filter(|token| !token.is_empty())
            .ok_or(AccessError::MissingToken)?;
        Ok(Principal {
            user: user.to_string(),
            token: Some(user.to_string()),
        })
    }

    async fn authorize(&self, _principal: &Principal, key: &RoomKey) -> Result<(), AccessError> {
        if self
            .missing
            .contains(&(key.collection.clone(), key.item.clone()))
        {
            return Err(AccessError::NotFound(key.display_name()));
        }
        if self.forbidden.contains(&key.collection) {
            return Err(AccessError::Forbidden(key.display_name()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
    }

    #[test_timeout::tokio_timeout_test]
    async fn hs256_tokens_resolve_to_subject() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims { sub: "editor-7" },
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        let access = TokenAccess::new(Some("s3cret"), None);
        let principal = access.authenticate(Some(&token)).await.unwrap();
        assert_eq!(principal.user, "editor-7");
        assert_eq!(principal.token.as_deref(), Some(token.as_str()));

        let wrong = TokenAccess::new(Some("other"), None);
        assert!(matches!(
            wrong.authenticate(Some(&token)).await,
            Err(AccessError::InvalidToken(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn raw_tokens_are_user_ids_without_secret() {
        let access = TokenAccess::new(None, None);
        let principal = access.authenticate(Some("alice")).await.unwrap();
        assert_eq!(principal.user, "alice");
        assert!(matches!(
            access.authenticate(Some("  ")).await,
            Err(AccessError::MissingToken)
        ));
        assert!(matches!(
            access.authenticate(None).await,
            Err(AccessError::MissingToken)
        ));
        let key = RoomKey::new("articles", Some("1".into()), None);
        assert!(access.authorize(&principal, &key).await.is_ok());
    }

    #[test_timeout::timeout]
    fn item_urls_cover_singletons_and_items() {
        let remote = RemoteAccess::new("http://api.local/");
        assert_eq!(
            remote.item_url(&RoomKey::new("articles", Some("9".into()), None)),
            "http://api.local/items/articles/9"
        );
        assert_eq!(
            remote.item_url(&RoomKey::new("settings", None, None)),
            "http://api.local/items/settings"
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn static_rules_apply() {
        let access = StaticAccess::allow_all()
            .forbid_collection("secrets")
            .missing_item("articles", Some("404"));
        let principal = access.authenticate(Some("bob")).await.unwrap();
        let forbidden = RoomKey::new("secrets", Some("1".into()), None);
        let missing = RoomKey::new("articles", Some("404".into()), None);
        let fine = RoomKey::new("articles", Some("1".into()), None);
        assert!(matches!(
            access.authorize(&principal, &forbidden).await,
            Err(AccessError::Forbidden(_))
        ));
        assert!(matches!(
            access.authorize(&principal, &missing).await,
            Err(AccessError::NotFound(_))
        ));
        assert!(access.authorize(&principal, &fine).await.is_ok());
    }
}
