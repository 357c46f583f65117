use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::credentials::TokenStore;
use crate::error::Result;
use crate::storage::KeyValueStore;

/// Store key holding the bearer credential.
const CREDENTIAL_KEY: &str = "credential";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub stored_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            stored_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.stored_at
    }

    /// Pull a token out of a login/refresh response body.
    ///
    /// Accepts `access_token`, `accessToken` or `token`, at the top level or
    /// under `data`. Cookie-only servers return none of these.
    pub fn from_response(body: &Value) -> Option<Self> {
        const FIELDS: [&str; 3] = ["access_token", "accessToken", "token"];
        let scopes = [Some(body), body.get("data")];
        scopes.into_iter().flatten().find_map(|scope| {
            FIELDS.iter().find_map(|field| match scope.get(*field) {
                Some(Value::String(token)) if !token.is_empty() => Some(Credential::new(token)),
                _ => None,
            })
        })
    }
}

/// Bearer credential persisted in the gateway's key-value store.
pub struct StoredTokens {
    store: Arc<dyn KeyValueStore>,
}

impl StoredTokens {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenStore for StoredTokens {
    async fn load(&self) -> Result<Option<Credential>> {
        match self.store.get(CREDENTIAL_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        self.store
            .set(CREDENTIAL_KEY, serde_json::to_value(credential)?)
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.store.remove(CREDENTIAL_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_credential_from_response_shapes() {
        let top = Credential::from_response(&json!({"access_token": "a1"})).unwrap();
        assert_eq!(top.token, "a1");
        let nested = Credential::from_response(&json!({"data": {"token": "n1"}})).unwrap();
        assert_eq!(nested.token, "n1");
        assert!(Credential::from_response(&json!({"message": "refreshed"})).is_none());
        assert!(Credential::from_response(&json!({"token": ""})).is_none());
    }

    #[tokio::test]
    async fn test_stored_tokens_round_trip() {
        let tokens = StoredTokens::new(Arc::new(MemoryStore::new()));
        assert!(tokens.load().await.unwrap().is_none());

        tokens.save(&Credential::new("abc")).await.unwrap();
        assert_eq!(tokens.load().await.unwrap().unwrap().token, "abc");

        tokens.clear().await.unwrap();
        tokens.clear().await.unwrap();
        assert!(tokens.load().await.unwrap().is_none());
    }
}
