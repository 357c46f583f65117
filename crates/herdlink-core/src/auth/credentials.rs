use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::session::Credential;
use crate::error::{GatewayError, Result};

const SERVICE_NAME: &str = "herdlink";

/// Single-key store for the bearer credential.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>>;

    async fn save(&self, credential: &Credential) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Bearer credential kept in the OS keychain.
pub struct KeychainTokens {
    account: String,
}

impl KeychainTokens {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).map_err(|e| {
            GatewayError::Storage(format!("Failed to create keyring entry: {}", e))
        })
    }
}

#[async_trait]
impl TokenStore for KeychainTokens {
    async fn load(&self) -> Result<Option<Credential>> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(serde_json::from_str(&secret).ok()),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(GatewayError::Storage(format!(
                "Failed to retrieve credential from keychain: {}",
                e
            ))),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        let secret = serde_json::to_string(credential)?;
        self.entry()?.set_password(&secret).map_err(|e| {
            GatewayError::Storage(format!("Failed to store credential in keychain: {}", e))
        })
    }

    async fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                debug!("No keychain credential to clear");
                Ok(())
            }
            Err(e) => Err(GatewayError::Storage(format!(
                "Failed to delete credential from keychain: {}",
                e
            ))),
        }
    }
}
