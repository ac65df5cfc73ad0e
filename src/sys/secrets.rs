// src/sys/secrets.rs

use secrecy::{ExposeSecret, SecretString};

/// Opaque wrapper for the SSH password or private-key material supplied by
/// the configuration.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. The backing memory is zeroized when the value is dropped.
pub struct Credential {
    secret: SecretString,
}

impl Credential {
    pub fn new(raw: String) -> Self {
        Self { secret: SecretString::new(raw) }
    }

    /// Wraps a secret that already lives in a zeroizing container, e.g.
    /// the password field deserialized from configuration.
    pub fn from_secret(secret: SecretString) -> Self {
        Self { secret }
    }

    /// Exposes the secret for the duration of the closure only. The borrow
    /// checker guarantees the plaintext reference cannot escape the call.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.secret.expose_secret())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_is_redacted() {
        let cred = Credential::new("hunter2".to_string());
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn secret_is_scoped_to_closure() {
        let cred = Credential::new("hunter2".to_string());
        let len = cred.use_secret(|s| s.len());
        assert_eq!(len, 7);
    }
}
