use std::{
    fmt::Debug,
    path::PathBuf,
    sync::RwLock,
};

/// Bearer token used for catalog requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential([REDACTED])")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential rejected by catalog")]
    Rejected,

    #[error("no credential available: {0}")]
    Missing(String),

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// Source of catalog credentials.
///
/// The refresh flow itself lives outside this crate; implementations only
/// hand out whatever credential is currently valid.
pub trait CredentialProvider: Send + Sync {
    /// Current credential, possibly cached.
    fn credential(&self) -> Result<Credential, AuthError>;

    /// Called after the catalog rejected the current credential.
    fn refresh(&self) -> Result<Credential, AuthError>;
}

/// A fixed token. Cannot be refreshed.
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Result<Credential, AuthError> {
        Ok(self.credential.clone())
    }

    fn refresh(&self) -> Result<Credential, AuthError> {
        Err(AuthError::RefreshFailed(
            "static token cannot be refreshed".to_string(),
        ))
    }
}

/// Token kept in a file that an external process rotates.
///
/// The file is read on first use and again on every refresh. A refresh that
/// yields the same token that was just rejected counts as a failure.
pub struct TokenFile {
    path: PathBuf,
    current: RwLock<Option<Credential>>,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
        }
    }

    fn read_token(&self) -> Result<Credential, AuthError> {
        let token = std::fs::read_to_string(&self.path)
            .map_err(|err| AuthError::Missing(format!("{}: {err}", self.path.display())))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        Ok(Credential::new(token))
    }
}

impl CredentialProvider for TokenFile {
    fn credential(&self) -> Result<Credential, AuthError> {
        if let Some(credential) = self.current.read().ok().and_then(|c| c.clone()) {
            return Ok(credential);
        }

        let credential = self.read_token()?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(credential.clone());
        }
        Ok(credential)
    }

    fn refresh(&self) -> Result<Credential, AuthError> {
        let fresh = self.read_token()?;
        let mut current = self
            .current
            .write()
            .map_err(|_| AuthError::RefreshFailed("credential lock poisoned".to_string()))?;

        if current.as_ref() == Some(&fresh) {
            return Err(AuthError::RefreshFailed(format!(
                "{} still holds the rejected token",
                self.path.display()
            )));
        }

        log::info!("reloaded catalog token from {}", self.path.display());
        *current = Some(fresh.clone());
        Ok(fresh)
    }
}
