use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

/// Account passwords kept in the system keyring
#[derive(Clone)]
pub struct CredentialManager {
    app_name: String,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialManager {
    pub fn new() -> Self {
        Self {
            app_name: "mailsync".to_string(),
        }
    }

    fn entry(&self, account_id: &str, password_type: &str) -> Result<Entry> {
        let service = format!("{}-{}", self.app_name, password_type);
        Entry::new(&service, account_id).context("Failed to create keyring entry")
    }

    pub fn store_password(&self, account_id: &str, password_type: &str, password: &str) -> Result<()> {
        self.entry(account_id, password_type)?
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored securely for {} ({})", account_id, password_type);
        Ok(())
    }

    pub fn get_password(&self, account_id: &str, password_type: &str) -> Result<Option<String>> {
        match self.entry(account_id, password_type)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    pub fn delete_password(&self, account_id: &str, password_type: &str) -> Result<()> {
        match self.entry(account_id, password_type)?.delete_password() {
            Ok(()) => {
                log::debug!("Password deleted for {} ({})", account_id, password_type);
                Ok(())
            }
            // Password doesn't exist, that's fine
            Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete password: {}", e)),
        }
    }
}
