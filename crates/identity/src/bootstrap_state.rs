//! Bootstrap state machine.
//!
//! Tracks one certificate-bootstrap attempt from idle through certificate
//! installation. Each transition is validated against the current state and
//! recorded in a bounded, hash-linked history for audit.
//!
//! # State Transitions
//!
//! ```text
//! Idle
//!     ↓ (request_challenge)
//! ChallengeRequested
//!     ↓ (receive_challenge)
//! ChallengeReceived
//!     ↓ (send_signed_response)
//! ResponseSent
//!     ↓ (receive_certificate)
//! CertificateReceived
//!     ↓ (install_certificate)
//! Installed
//! ```
//!
//! `Failed(reason)` is reachable from every non-terminal state. No
//! transition past `ChallengeReceived` happens without a successful signing
//! operation; the driver in [`crate::bootstrap`] enforces that by only
//! calling [`BootstrapStateMachine::on_response_sent`] with the hash of a
//! signature the keystore produced.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Maximum number of state transitions to keep in history.
const MAX_HISTORY_SIZE: usize = 32;

/// State of one bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BootstrapState {
    /// No attempt in progress
    Idle,

    /// Challenge requested from the controller
    ChallengeRequested {
        /// When the request was sent
        requested_at: u64,
    },

    /// Challenge received from the controller
    ChallengeReceived {
        /// Hash of the challenge for audit
        challenge_hash: Vec<u8>,
        /// When the challenge arrived
        received_at: u64,
    },

    /// Signed response sent back to the controller
    ResponseSent {
        /// Hash of the signature for audit
        response_hash: Vec<u8>,
        /// When the response was sent
        sent_at: u64,
    },

    /// Certificate received, not yet validated/installed
    CertificateReceived {
        /// Hash of the certificate DER for audit
        certificate_hash: Vec<u8>,
        /// When the certificate arrived
        received_at: u64,
    },

    /// Certificate validated and installed into the trust store
    Installed {
        /// Serial of the installed certificate
        certificate_serial: String,
        /// When installation completed
        installed_at: u64,
    },

    /// Attempt failed
    Failed {
        /// Terminal failure reason
        reason: BootstrapFailure,
        /// When the failure occurred
        failed_at: u64,
    },
}

/// Terminal failure reasons for a bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum BootstrapFailure {
    /// Controller unreachable (DNS, connect, TLS, request failure)
    #[error("network error: {0}")]
    NetworkError(String),

    /// Controller answered with something the protocol cannot use
    #[error("malformed controller response: {0}")]
    ProtocolError(String),

    /// The keystore could not sign the challenge
    #[error("challenge signing failed: {0}")]
    SigningError(String),

    /// Controller refused the signed response
    #[error("controller rejected the bootstrap attempt: {0}")]
    Rejected(String),

    /// The returned certificate failed local validation
    #[error("certificate validation failed: {0}")]
    InvalidCertificate(String),

    /// A network step exceeded the configured timeout
    #[error("bootstrap step timed out after {0}ms")]
    Timeout(u64),
}

/// Errors raised on invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum StateError {
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
}

/// Record of a state transition for the audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state (rendered)
    pub from_state: String,
    /// New state (rendered)
    pub to_state: String,
    /// When the transition occurred
    pub timestamp: u64,
    /// Hash over this transition and the previous transition's hash
    pub transition_hash: Vec<u8>,
}

/// State machine for one bootstrap attempt.
#[derive(Debug)]
pub struct BootstrapStateMachine {
    current_state: BootstrapState,
    history: VecDeque<StateTransition>,
}

impl BootstrapStateMachine {
    /// Create a machine in `Idle`.
    pub fn new() -> Self {
        Self {
            current_state: BootstrapState::Idle,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    /// The current state.
    pub fn current_state(&self) -> &BootstrapState {
        &self.current_state
    }

    /// The transition history, oldest first.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// Whether the attempt ended with an installed certificate.
    pub fn is_installed(&self) -> bool {
        matches!(self.current_state, BootstrapState::Installed { .. })
    }

    /// Whether the machine reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.current_state,
            BootstrapState::Installed { .. } | BootstrapState::Failed { .. }
        )
    }

    /// Transition: Idle → ChallengeRequested
    pub fn on_challenge_requested(&mut self) -> Result<(), StateError> {
        match self.current_state {
            BootstrapState::Idle => {
                let now = current_timestamp();
                self.transition(BootstrapState::ChallengeRequested { requested_at: now });
                Ok(())
            }
            _ => Err(StateError::InvalidTransition(
                "can only request a challenge from Idle".to_string(),
            )),
        }
    }

    /// Transition: ChallengeRequested → ChallengeReceived
    pub fn on_challenge_received(&mut self, challenge_hash: Vec<u8>) -> Result<(), StateError> {
        match self.current_state {
            BootstrapState::ChallengeRequested { .. } => {
                let now = current_timestamp();
                self.transition(BootstrapState::ChallengeReceived {
                    challenge_hash,
                    received_at: now,
                });
                Ok(())
            }
            _ => Err(StateError::InvalidTransition(
                "can only receive a challenge from ChallengeRequested".to_string(),
            )),
        }
    }

    /// Transition: ChallengeReceived → ResponseSent
    pub fn on_response_sent(&mut self, response_hash: Vec<u8>) -> Result<(), StateError> {
        match self.current_state {
            BootstrapState::ChallengeReceived { .. } => {
                let now = current_timestamp();
                self.transition(BootstrapState::ResponseSent {
                    response_hash,
                    sent_at: now,
                });
                Ok(())
            }
            _ => Err(StateError::InvalidTransition(
                "can only send a response from ChallengeReceived".to_string(),
            )),
        }
    }

    /// Transition: ResponseSent → CertificateReceived
    pub fn on_certificate_received(
        &mut self,
        certificate_hash: Vec<u8>,
    ) -> Result<(), StateError> {
        match self.current_state {
            BootstrapState::ResponseSent { .. } => {
                let now = current_timestamp();
                self.transition(BootstrapState::CertificateReceived {
                    certificate_hash,
                    received_at: now,
                });
                Ok(())
            }
            _ => Err(StateError::InvalidTransition(
                "can only receive a certificate from ResponseSent".to_string(),
            )),
        }
    }

    /// Transition: CertificateReceived → Installed
    pub fn on_installed(&mut self, certificate_serial: String) -> Result<(), StateError> {
        match self.current_state {
            BootstrapState::CertificateReceived { .. } => {
                let now = current_timestamp();
                self.transition(BootstrapState::Installed {
                    certificate_serial,
                    installed_at: now,
                });
                Ok(())
            }
            _ => Err(StateError::InvalidTransition(
                "can only install from CertificateReceived".to_string(),
            )),
        }
    }

    /// Transition: any non-terminal state → Failed
    pub fn fail(&mut self, reason: BootstrapFailure) -> Result<(), StateError> {
        if self.is_terminal() {
            return Err(StateError::InvalidTransition(
                "attempt already reached a terminal state".to_string(),
            ));
        }
        let now = current_timestamp();
        self.transition(BootstrapState::Failed {
            reason,
            failed_at: now,
        });
        Ok(())
    }

    fn transition(&mut self, new_state: BootstrapState) {
        let now = current_timestamp();
        let from_state = render_state(&self.current_state);
        let to_state = render_state(&new_state);

        let mut hashed = Vec::new();
        if let Some(previous) = self.history.back() {
            hashed.extend_from_slice(&previous.transition_hash);
        }
        hashed.extend_from_slice(format!("{from_state}->{to_state};{now}").as_bytes());
        let transition_hash = blake3::hash(&hashed).as_bytes().to_vec();

        self.current_state = new_state;

        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            transition_hash,
        });
    }
}

impl Default for BootstrapStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn render_state(state: &BootstrapState) -> String {
    match state {
        BootstrapState::Idle => "Idle".to_string(),
        BootstrapState::ChallengeRequested { .. } => "ChallengeRequested".to_string(),
        BootstrapState::ChallengeReceived { .. } => "ChallengeReceived".to_string(),
        BootstrapState::ResponseSent { .. } => "ResponseSent".to_string(),
        BootstrapState::CertificateReceived { .. } => "CertificateReceived".to_string(),
        BootstrapState::Installed { .. } => "Installed".to_string(),
        BootstrapState::Failed { reason, .. } => format!("Failed({reason})"),
    }
}

/// Get current timestamp in milliseconds.
fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_starts_idle() {
        let machine = BootstrapStateMachine::new();
        assert_eq!(*machine.current_state(), BootstrapState::Idle);
        assert!(!machine.is_installed());
        assert!(!machine.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = BootstrapStateMachine::new();

        machine.on_challenge_requested().unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::ChallengeRequested { .. }
        ));

        machine.on_challenge_received(vec![1, 2, 3]).unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::ChallengeReceived { .. }
        ));

        machine.on_response_sent(vec![4, 5, 6]).unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::ResponseSent { .. }
        ));

        machine.on_certificate_received(vec![7, 8, 9]).unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::CertificateReceived { .. }
        ));

        machine.on_installed("serial-1".to_string()).unwrap();
        assert!(machine.is_installed());
        assert!(machine.is_terminal());

        assert_eq!(machine.history().len(), 5);
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut machine = BootstrapStateMachine::new();

        assert!(machine.on_challenge_received(vec![1]).is_err());
        assert!(machine.on_response_sent(vec![1]).is_err());
        assert!(machine.on_certificate_received(vec![1]).is_err());
        assert!(machine.on_installed("serial".to_string()).is_err());
    }

    #[test]
    fn test_cannot_install_without_certificate_received() {
        let mut machine = BootstrapStateMachine::new();
        machine.on_challenge_requested().unwrap();
        machine.on_challenge_received(vec![1]).unwrap();
        machine.on_response_sent(vec![2]).unwrap();

        let result = machine.on_installed("serial".to_string());
        assert!(result.is_err());
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        let mut machine = BootstrapStateMachine::new();
        machine
            .fail(BootstrapFailure::NetworkError("down".to_string()))
            .unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::Failed { .. }
        ));

        let mut machine = BootstrapStateMachine::new();
        machine.on_challenge_requested().unwrap();
        machine.fail(BootstrapFailure::Timeout(30_000)).unwrap();
        assert!(matches!(
            machine.current_state(),
            BootstrapState::Failed {
                reason: BootstrapFailure::Timeout(30_000),
                ..
            }
        ));
    }

    #[test]
    fn test_fail_from_terminal_state_is_rejected() {
        let mut machine = BootstrapStateMachine::new();
        machine
            .fail(BootstrapFailure::ProtocolError("bad".to_string()))
            .unwrap();
        let again = machine.fail(BootstrapFailure::ProtocolError("worse".to_string()));
        assert!(again.is_err());
    }

    #[test]
    fn test_no_transitions_after_installed() {
        let mut machine = BootstrapStateMachine::new();
        machine.on_challenge_requested().unwrap();
        machine.on_challenge_received(vec![1]).unwrap();
        machine.on_response_sent(vec![2]).unwrap();
        machine.on_certificate_received(vec![3]).unwrap();
        machine.on_installed("serial".to_string()).unwrap();

        assert!(machine.on_challenge_requested().is_err());
        assert!(machine
            .fail(BootstrapFailure::Rejected("late".to_string()))
            .is_err());
    }

    #[test]
    fn test_history_is_hash_linked() {
        let mut machine = BootstrapStateMachine::new();
        machine.on_challenge_requested().unwrap();
        machine.on_challenge_received(vec![1]).unwrap();

        let history = machine.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_state, "Idle");
        assert_eq!(history[0].to_state, "ChallengeRequested");
        assert_eq!(history[1].from_state, "ChallengeRequested");
        assert_eq!(history[1].to_state, "ChallengeReceived");
        assert!(!history[0].transition_hash.is_empty());
        assert_ne!(history[0].transition_hash, history[1].transition_hash);
    }

    #[test]
    fn test_failure_reason_rendering() {
        let failures = vec![
            BootstrapFailure::NetworkError("dns".to_string()),
            BootstrapFailure::ProtocolError("empty challenge".to_string()),
            BootstrapFailure::SigningError("no key".to_string()),
            BootstrapFailure::Rejected("status 403".to_string()),
            BootstrapFailure::InvalidCertificate("wrong issuer".to_string()),
            BootstrapFailure::Timeout(30_000),
        ];
        for failure in failures {
            assert!(!failure.to_string().is_empty());
        }
    }
}
