//! # Pairing
//!
//! Pairing codes (host side) and the companion's pairing state machine.
//!
//! ## Pairing Flow
//! ```text
//! ┌──────────────┐                                   ┌──────────────┐
//! │  Companion   │                                   │     Host     │
//! └──────┬───────┘                                   └──────┬───────┘
//!        │  WS handshake (X-Device-ID/Type/Name)            │
//!        │─────────────────────────────────────────────────►│
//!        │                       connected                  │
//!        │◄─────────────────────────────────────────────────│
//!        │                    pairing_required              │  trust store:
//!        │◄─────────────────────────────────────────────────│  untrusted
//!        │  pair { code, deviceName }                       │
//!        │─────────────────────────────────────────────────►│
//!        │        paired  |  pairing_failed { message }     │
//!        │◄─────────────────────────────────────────────────│
//!        │                                                  │
//!        │  (window expires)      pairing_timeout           │
//!        │◄─────────────────────────────────────────────────│
//! ```
//!
//! ## State Machine (companion)
//! ```text
//!            pairing_required          paired / connected{auth}
//!  Unpaired ──────────────────► PairingRequired ─────────────────► Paired
//!     ▲                              │    ▲                          │
//!     │      pairing_timeout         │    │ pairing_failed           │
//!     └──────────────────────────────┘    └──────────                │
//!     ▲                                                              │
//!     └──────────────────────────── unpaired ────────────────────────┘
//! ```
//!
//! The machine is pure: it returns a [`PairingEffect`] and the connection
//! client performs it (persist trust, prompt, reconnect).

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::types::PairingState;

// =============================================================================
// Pairing Code
// =============================================================================

/// The host's single active pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    code: String,
    issued_at: DateTime<Utc>,
    ttl: Duration,
}

impl PairingCode {
    /// Generates a random 6-digit code valid for `ttl`.
    pub fn generate(ttl: Duration) -> Self {
        let value: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
        Self::with_code(format!("{:06}", value), ttl)
    }

    /// Wraps a known code. Used by tests and operator overrides.
    pub fn with_code(code: impl Into<String>, ttl: Duration) -> Self {
        Self {
            code: code.into(),
            issued_at: Utc::now(),
            ttl,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Whether the code's TTL has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now >= self.issued_at + ttl,
            // TTL too large to represent: never expires.
            Err(_) => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Exact comparison against an unexpired code. No trimming, no prefixes.
    pub fn matches(&self, candidate: &str) -> bool {
        !self.is_expired() && self.code == candidate
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Host message or local event that drives pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// `connected`, with `authenticated: true` for a recognized device.
    Connected { authenticated: bool },
    PairingRequired,
    Paired,
    PairingFailed { message: String },
    PairingTimeout,
    Unpaired,
    /// `error { error: "not_authenticated" }`.
    NotAuthenticated,
    /// The socket closed for any reason.
    Disconnected,
}

/// What the owner of the state machine must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEffect {
    None,
    /// Persist the local trust marker.
    TrustGranted,
    /// Ask the user for the code, optionally showing the host's rejection.
    PromptForCode { error: Option<String> },
    /// Disconnect and reconnect without spending reconnect budget.
    ForceReconnect,
    /// Clear the trust marker and disconnect; no automatic reconnect.
    Revoked,
    /// Clear the trust marker and prompt for a code.
    ReauthRequired,
}

/// Companion-side pairing state machine.
#[derive(Debug, Clone, Default)]
pub struct PairingStateMachine {
    state: PairingState,
    last_error: Option<String>,
}

impl PairingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    /// Message from the last `pairing_failed`, cleared on any other transition.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_paired(&self) -> bool {
        self.state == PairingState::Paired
    }

    /// Applies one event and returns the side effect to perform.
    pub fn handle(&mut self, event: PairingEvent) -> PairingEffect {
        if !matches!(event, PairingEvent::PairingFailed { .. }) {
            self.last_error = None;
        }

        match event {
            PairingEvent::Connected { authenticated: true } | PairingEvent::Paired => {
                self.state = PairingState::Paired;
                PairingEffect::TrustGranted
            }
            PairingEvent::Connected {
                authenticated: false,
            } => {
                self.state = PairingState::Unpaired;
                PairingEffect::None
            }
            PairingEvent::PairingRequired => {
                self.state = PairingState::PairingRequired;
                PairingEffect::PromptForCode { error: None }
            }
            PairingEvent::PairingFailed { message } => {
                self.state = PairingState::PairingRequired;
                self.last_error = Some(message.clone());
                PairingEffect::PromptForCode {
                    error: Some(message),
                }
            }
            PairingEvent::PairingTimeout => {
                self.state = PairingState::Unpaired;
                PairingEffect::ForceReconnect
            }
            PairingEvent::Unpaired => {
                self.state = PairingState::Unpaired;
                PairingEffect::Revoked
            }
            PairingEvent::NotAuthenticated => {
                self.state = PairingState::PairingRequired;
                PairingEffect::ReauthRequired
            }
            PairingEvent::Disconnected => {
                self.state = PairingState::Unpaired;
                PairingEffect::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_is_six_digits() {
        for _ in 0..200 {
            let code = PairingCode::generate(Duration::from_secs(60));
            assert_eq!(code.code().len(), 6);
            assert!(code.code().chars().all(|c| c.is_ascii_digit()));
            assert!(!code.code().starts_with('0'));
        }
    }

    #[test]
    fn test_code_matches_exactly() {
        let code = PairingCode::with_code("123456", Duration::from_secs(60));
        assert!(code.matches("123456"));
        assert!(!code.matches(" 123456"));
        assert!(!code.matches("12345"));
        assert!(!code.matches("1234567"));
        assert!(!code.matches(""));
    }

    #[test]
    fn test_expired_code_never_matches() {
        let code = PairingCode::with_code("123456", Duration::ZERO);
        assert!(code.is_expired());
        assert!(!code.matches("123456"));

        let later = code.issued_at() + chrono::Duration::seconds(5);
        let fresh = PairingCode::with_code("654321", Duration::from_secs(60));
        assert!(!fresh.is_expired_at(fresh.issued_at()));
        assert!(code.is_expired_at(later));
    }

    #[test]
    fn test_fresh_device_pairs() {
        let mut machine = PairingStateMachine::new();
        assert_eq!(
            machine.handle(PairingEvent::Connected {
                authenticated: false
            }),
            PairingEffect::None
        );
        assert_eq!(
            machine.handle(PairingEvent::PairingRequired),
            PairingEffect::PromptForCode { error: None }
        );
        assert_eq!(machine.state(), PairingState::PairingRequired);
        assert_eq!(machine.handle(PairingEvent::Paired), PairingEffect::TrustGranted);
        assert!(machine.is_paired());
    }

    #[test]
    fn test_wrong_code_stays_in_pairing() {
        let mut machine = PairingStateMachine::new();
        machine.handle(PairingEvent::PairingRequired);
        let effect = machine.handle(PairingEvent::PairingFailed {
            message: "Invalid pairing code".into(),
        });
        assert_eq!(
            effect,
            PairingEffect::PromptForCode {
                error: Some("Invalid pairing code".into())
            }
        );
        assert_eq!(machine.state(), PairingState::PairingRequired);
        assert_eq!(machine.last_error(), Some("Invalid pairing code"));

        machine.handle(PairingEvent::Paired);
        assert_eq!(machine.last_error(), None);
    }

    #[test]
    fn test_trusted_device_skips_pairing() {
        let mut machine = PairingStateMachine::new();
        assert_eq!(
            machine.handle(PairingEvent::Connected {
                authenticated: true
            }),
            PairingEffect::TrustGranted
        );
        assert!(machine.is_paired());
    }

    #[test]
    fn test_timeout_and_revocation() {
        let mut machine = PairingStateMachine::new();
        machine.handle(PairingEvent::PairingRequired);
        assert_eq!(
            machine.handle(PairingEvent::PairingTimeout),
            PairingEffect::ForceReconnect
        );
        assert_eq!(machine.state(), PairingState::Unpaired);

        machine.handle(PairingEvent::Paired);
        assert_eq!(machine.handle(PairingEvent::Unpaired), PairingEffect::Revoked);
        assert_eq!(machine.state(), PairingState::Unpaired);

        machine.handle(PairingEvent::Paired);
        assert_eq!(
            machine.handle(PairingEvent::NotAuthenticated),
            PairingEffect::ReauthRequired
        );
        assert_eq!(machine.state(), PairingState::PairingRequired);
    }

    #[test]
    fn test_disconnect_resets_pairing() {
        let mut machine = PairingStateMachine::new();
        machine.handle(PairingEvent::Paired);
        machine.handle(PairingEvent::Disconnected);
        assert!(!machine.is_paired());
    }
}
