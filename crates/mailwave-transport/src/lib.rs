//! # Mailwave Transport
//!
//! The wire seam of the delivery engine: one trait, one bounded operation.
//! A transport call either succeeds, fails permanently for this recipient
//! (bounce-class), or fails transiently (retry-class) — the delivery worker
//! maps those three cases onto the row state machine.

pub mod smtp;

pub use smtp::SmtpMailer;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Successful send.
#[derive(Debug, Clone, Default)]
pub struct SendReply {
    /// Server response line, when the transport exposes one.
    pub smtp_response: Option<String>,
}

/// Classified send failure.
#[derive(Debug, Clone)]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Could not reach or negotiate with the server — transient.
    Connection,
    /// Credentials rejected — transient from the row's point of view
    /// (operator fixes config, queue retries).
    Auth,
    /// Server permanently rejected the message (5xx) — bounce-class.
    Rejected,
    /// Recipient address unusable — bounce-class.
    InvalidRecipient,
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Permanent failures mark the row bounced; transient ones retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            SendErrorKind::Rejected | SendErrorKind::InvalidRecipient
        )
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SendError {}

/// One bounded send per call; no connection state carried between calls.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        to_name: Option<&str>,
        subject: &str,
        body: &str,
    ) -> Result<SendReply, SendError>;
}

/// Recorded outgoing message (mock transport).
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Scriptable in-memory transport for tests and dry runs: succeeds by
/// default, records every accepted message, and can be told to fail per
/// address — always, or only for the first N calls.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentMail>>,
    failures: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<u64>,
}

struct Scripted {
    kind: SendErrorKind,
    remaining: Option<u32>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `addr` fails with `kind`.
    pub fn fail_always(&self, addr: &str, kind: SendErrorKind) {
        self.failures.lock().unwrap().insert(
            addr.to_string(),
            Scripted {
                kind,
                remaining: None,
            },
        );
    }

    /// The first `n` sends to `addr` fail with `kind`, then succeed.
    pub fn fail_times(&self, addr: &str, kind: SendErrorKind, n: u32) {
        self.failures.lock().unwrap().insert(
            addr.to_string(),
            Scripted {
                kind,
                remaining: Some(n),
            },
        );
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    /// Total send calls, including failed ones.
    pub fn call_count(&self) -> u64 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl EmailTransport for MockTransport {
    async fn send(
        &self,
        to: &str,
        _to_name: Option<&str>,
        subject: &str,
        body: &str,
    ) -> Result<SendReply, SendError> {
        *self.calls.lock().unwrap() += 1;

        let mut failures = self.failures.lock().unwrap();
        if let Some(script) = failures.get_mut(to) {
            let fire = match &mut script.remaining {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            if fire {
                return Err(SendError::new(script.kind, format!("scripted failure for {to}")));
            }
        }
        drop(failures);

        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(SendReply {
            smtp_response: Some("250 OK (mock)".into()),
        })
    }
}
