//! One-time code issuance and verification
//!
//! Each recipient has at most one active code. Issuing replaces the prior
//! code; verifying consumes it. Both run under a per-recipient lock so a
//! verification never races a replacement.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use courier_common::{MessageId, OtpCode, tracing};
use courier_store::{OtpStore, StoreError};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpConfig {
    /// How long an issued code stays valid, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

const fn default_ttl_secs() -> u64 {
    300 // 5 minutes
}

impl OtpConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Returned to callers for every rejected code, whatever the reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("OTP verification failed")]
pub struct OtpFailure;

/// Why a code was rejected; only ever logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtpRejection {
    NotFound,
    Expired,
    Mismatch,
    AlreadyConsumed,
}

impl OtpRejection {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "no code issued",
            Self::Expired => "code expired",
            Self::Mismatch => "code mismatch",
            Self::AlreadyConsumed => "code already used",
        }
    }
}

/// A freshly issued code and the one it replaced, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCode {
    pub code: OtpCode,
    pub superseded: Option<OtpCode>,
}

#[derive(Debug)]
pub struct OtpVerifier {
    config: OtpConfig,
    store: Arc<dyn OtpStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl OtpVerifier {
    #[must_use]
    pub fn new(config: OtpConfig, store: Arc<dyn OtpStore>) -> Self {
        Self {
            config,
            store,
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.config.ttl()
    }

    /// Run `operation` holding the recipient's lock
    ///
    /// The lock is dropped from the map once nobody else holds or waits on it.
    async fn locked<T>(&self, recipient: &str, operation: impl Future<Output = T>) -> T {
        let lock = self
            .locks
            .entry(recipient.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            operation.await
        };

        drop(lock);
        self.locks
            .remove_if(recipient, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Issue a new code for `recipient`, replacing any earlier one
    ///
    /// # Errors
    /// Returns an error if the code could not be stored
    pub async fn issue(
        &self,
        recipient: &str,
        message_id: Option<MessageId>,
    ) -> Result<IssuedCode, StoreError> {
        self.issue_at(recipient, message_id, SystemTime::now()).await
    }

    pub async fn issue_at(
        &self,
        recipient: &str,
        message_id: Option<MessageId>,
        now: SystemTime,
    ) -> Result<IssuedCode, StoreError> {
        let code = OtpCode {
            recipient: recipient.to_string(),
            code: generate_code(),
            issued_at: now,
            expires_at: now + self.ttl(),
            consumed: false,
            message_id,
        };

        self.locked(recipient, async {
            let superseded = self.store.replace_code(&code).await?;
            tracing::debug!(
                message_id = ?message_id,
                replaced = superseded.is_some(),
                "Issued one-time code"
            );

            Ok::<_, StoreError>(IssuedCode {
                code: code.clone(),
                superseded,
            })
        })
        .await
    }

    /// Undo an issue whose message could not be recorded
    ///
    /// The code it replaced becomes active again, or with nothing to restore
    /// the new code is marked consumed. A code issued since is left alone.
    ///
    /// # Errors
    /// Returns an error if the store could not be written
    pub async fn withdraw(&self, issued: &IssuedCode) -> Result<(), StoreError> {
        let recipient = issued.code.recipient.as_str();

        self.locked(recipient, async {
            if self.store.code_for(recipient).await?.as_ref() != Some(&issued.code) {
                return Ok(());
            }

            match &issued.superseded {
                Some(previous) => {
                    self.store.replace_code(previous).await?;
                }
                None => {
                    let revoked = OtpCode {
                        consumed: true,
                        ..issued.code.clone()
                    };
                    self.store.save_code(&revoked).await?;
                }
            }

            tracing::debug!(message_id = ?issued.code.message_id, "Withdrew one-time code");
            Ok::<_, StoreError>(())
        })
        .await
    }

    /// Check `candidate` against the active code for `recipient`, consuming
    /// it on success
    ///
    /// # Errors
    /// Returns [`OtpFailure`] for any rejection, including storage errors
    pub async fn verify(&self, recipient: &str, candidate: &str) -> Result<(), OtpFailure> {
        self.verify_at(recipient, candidate, SystemTime::now()).await
    }

    pub async fn verify_at(
        &self,
        recipient: &str,
        candidate: &str,
        now: SystemTime,
    ) -> Result<(), OtpFailure> {
        self.locked(recipient, async {
            let active = self.store.code_for(recipient).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to read one-time code");
                OtpFailure
            })?;

            let mut code = match check(active, candidate, now) {
                Ok(code) => code,
                Err(rejection) => {
                    tracing::info!(reason = rejection.as_str(), "Rejected one-time code");
                    return Err(OtpFailure);
                }
            };

            code.consumed = true;
            self.store.save_code(&code).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to consume one-time code");
                OtpFailure
            })?;

            tracing::debug!(message_id = ?code.message_id, "One-time code verified");
            Ok::<_, OtpFailure>(())
        })
        .await
    }
}

fn check(
    active: Option<OtpCode>,
    candidate: &str,
    now: SystemTime,
) -> Result<OtpCode, OtpRejection> {
    let code = active.ok_or(OtpRejection::NotFound)?;

    if code.consumed {
        return Err(OtpRejection::AlreadyConsumed);
    }

    if code.is_expired(now) {
        return Err(OtpRejection::Expired);
    }

    if !constant_time_eq(&code.code, candidate.trim()) {
        return Err(OtpRejection::Mismatch);
    }

    Ok(code)
}

fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// Compare without short-circuiting on the first differing byte
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Message text carrying a one-time code
#[must_use]
pub fn render_otp_content(code: &str, ttl: Duration) -> String {
    let minutes = ttl.as_secs().div_ceil(60).max(1);
    format!("Your verification code is {code}. It expires in {minutes} minutes.")
}
