//! Elevation credentials, resolved at call time and never retained.

use std::fmt;

use anyhow::Result;

/// An opaque secret. Debug and Display never reveal the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Source of the sudo credential for a single elevated execution.
pub trait CredentialProvider: Send + Sync {
    /// The credential, or `None` when no credential is configured.
    fn sudo_password(&self) -> Result<Option<Secret>>;
}

/// Reads the credential from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn sudo_password(&self) -> Result<Option<Secret>> {
        Ok(std::env::var(&self.var)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Secret::new))
    }
}

/// Provider with no credential; elevated executions fail distinctly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn sudo_password(&self) -> Result<Option<Secret>> {
        Ok(None)
    }
}

/// Fixed credential, for tests and embedding callers that resolve it themselves.
#[derive(Debug, Clone)]
pub struct StaticCredential(Secret);

impl StaticCredential {
    pub fn new(secret: Secret) -> Self {
        Self(secret)
    }
}

impl CredentialProvider for StaticCredential {
    fn sudo_password(&self) -> Result<Option<Secret>> {
        Ok(Some(self.0.clone()))
    }
}
