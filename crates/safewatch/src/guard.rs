//! Local credential check gating cancellation.
//!
//! A panicked originator, or someone who has taken their device, must not be
//! able to silently call off an alert. The guard fails closed: with no
//! credential configured every check is refused.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Key-derivation context for credential digests.
const DIGEST_CONTEXT: &str = "safewatch 2024 cancellation credential";

/// Metadata key under which the stored credential is persisted.
pub const CREDENTIAL_METADATA_KEY: &str = "cancellation_credential";

/// Errors reported by the cancellation guard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// The supplied credential does not match.
    #[error("wrong password")]
    WrongCredential,

    /// No credential has been configured, so nothing can be verified.
    #[error("no cancellation password is configured")]
    NotConfigured,

    /// A credential is required but none was supplied.
    #[error("a password is required to cancel")]
    MissingCredential,

    /// The new password is shorter than the configured minimum.
    #[error("password must be at least {min} characters")]
    PasswordTooShort {
        /// Minimum length in characters.
        min: usize,
    },

    /// An initial password was set twice.
    #[error("a cancellation password is already configured")]
    AlreadyConfigured,
}

/// Cancellation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationPolicy {
    /// Whether cancelling an active alert requires the password.
    pub require_password_on_cancel: bool,
    /// Minutes after which an active alert resolves itself. 0 disables.
    pub auto_resolve_after_minutes: u32,
    /// Minimum password length in characters.
    pub min_password_length: usize,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            require_password_on_cancel: true,
            auto_resolve_after_minutes: 60,
            min_password_length: 4,
        }
    }
}

/// A salted password digest, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    salt: String,
    digest: String,
}

impl StoredCredential {
    /// Derive a credential from a plain-text password with a fresh salt.
    #[must_use]
    pub fn derive(password: &str) -> Self {
        let salt = Uuid::new_v4().simple().to_string();
        let digest = digest(&salt, password).to_hex().to_string();
        Self { salt, digest }
    }

    /// Check a candidate in constant time.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let Ok(expected) = blake3::Hash::from_hex(&self.digest) else {
            return false;
        };
        // `blake3::Hash` equality is constant time.
        digest(&self.salt, candidate) == expected
    }
}

fn digest(salt: &str, password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_derive_key(DIGEST_CONTEXT);
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize()
}

/// Verifies cancellation credentials against a stored digest.
#[derive(Debug)]
pub struct CancellationGuard {
    policy: CancellationPolicy,
    credential: Mutex<Option<StoredCredential>>,
    failed_attempts: AtomicU32,
}

impl CancellationGuard {
    /// Create a guard with no credential configured.
    #[must_use]
    pub fn new(policy: CancellationPolicy) -> Self {
        Self {
            policy,
            credential: Mutex::new(None),
            failed_attempts: AtomicU32::new(0),
        }
    }

    /// Create a guard from a previously persisted credential.
    #[must_use]
    pub fn from_stored(policy: CancellationPolicy, credential: Option<StoredCredential>) -> Self {
        let guard = Self::new(policy);
        *guard.slot() = credential;
        guard
    }

    /// Create a guard with a plain-text password.
    #[must_use]
    pub fn with_password(policy: CancellationPolicy, password: &str) -> Self {
        Self::from_stored(policy, Some(StoredCredential::derive(password)))
    }

    /// The policy this guard enforces.
    #[must_use]
    pub fn policy(&self) -> &CancellationPolicy {
        &self.policy
    }

    /// Whether a credential is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.slot().is_some()
    }

    /// The stored credential, for persistence.
    #[must_use]
    pub fn credential(&self) -> Option<StoredCredential> {
        self.slot().clone()
    }

    /// Failed verifications since the last success.
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// Compare a candidate against the stored credential.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::NotConfigured`] when nothing is stored, and
    /// [`GuardError::WrongCredential`] on mismatch.
    pub fn verify(&self, candidate: &str) -> Result<(), GuardError> {
        let outcome = match self.slot().as_ref() {
            None => Err(GuardError::NotConfigured),
            Some(stored) if stored.matches(candidate) => Ok(()),
            Some(_) => Err(GuardError::WrongCredential),
        };

        match &outcome {
            Ok(()) => {
                self.failed_attempts.store(0, Ordering::SeqCst);
                debug!("Credential verified");
            }
            Err(e) => {
                let attempts = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failed_attempts = attempts, reason = %e, "Credential check failed");
            }
        }
        outcome
    }

    /// Apply the cancellation policy to an optional credential.
    ///
    /// # Errors
    ///
    /// Returns an error when a password is required and missing or wrong.
    pub fn authorize(&self, credential: Option<&str>) -> Result<(), GuardError> {
        if !self.policy.require_password_on_cancel {
            return Ok(());
        }
        match credential {
            Some(candidate) => self.verify(candidate),
            None => {
                self.failed_attempts.fetch_add(1, Ordering::SeqCst);
                warn!("Cancellation attempted without a password");
                Err(GuardError::MissingCredential)
            }
        }
    }

    /// Replace the password after verifying the old one.
    ///
    /// # Errors
    ///
    /// Returns an error if `old` does not verify or `new` is too short.
    pub fn change_password(&self, old: &str, new: &str) -> Result<StoredCredential, GuardError> {
        self.verify(old)?;
        self.check_length(new)?;

        let credential = StoredCredential::derive(new);
        *self.slot() = Some(credential.clone());
        info!("Cancellation password changed");
        Ok(credential)
    }

    /// Set the first password. Only allowed while none is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if a password already exists or `new` is too short.
    pub fn set_initial_password(&self, new: &str) -> Result<StoredCredential, GuardError> {
        self.check_length(new)?;

        let mut slot = self.slot();
        if slot.is_some() {
            return Err(GuardError::AlreadyConfigured);
        }
        let credential = StoredCredential::derive(new);
        *slot = Some(credential.clone());
        info!("Cancellation password set");
        Ok(credential)
    }

    fn check_length(&self, password: &str) -> Result<(), GuardError> {
        if password.chars().count() < self.policy.min_password_length {
            return Err(GuardError::PasswordTooShort {
                min: self.policy.min_password_length,
            });
        }
        Ok(())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<StoredCredential>> {
        self.credential.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
