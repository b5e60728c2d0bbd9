//! Pairing code lifecycle
//!
//! A daemon announces a short-lived code over its tunnel; the user types
//! the same code into a client, which posts it here. At most one code is
//! pending at a time, it expires after a TTL, and it dies with the tunnel
//! that announced it.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

/// Why `verify` did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingVerdict {
    /// Code matches the pending announcement
    Verified,
    /// No pending announcement matches this code
    NoPendingPairing,
    /// The pending code outlived its TTL
    CodeExpired,
}

impl PairingVerdict {
    /// Wire string used in error bodies
    pub fn as_error_str(&self) -> &'static str {
        match self {
            PairingVerdict::Verified => "verified",
            PairingVerdict::NoPendingPairing => "no_pending_pairing",
            PairingVerdict::CodeExpired => "code_expired",
        }
    }
}

struct PendingPairing {
    code: String,
    announced_at: Instant,
    /// Tunnel generation that announced the code
    generation: u64,
}

pub struct PairingManager {
    ttl: Duration,
    pending: StdMutex<Option<PendingPairing>>,
}

impl PairingManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: StdMutex::new(None),
        }
    }

    /// Register a newly announced code. Returns true if an earlier code
    /// was replaced; the caller answers that earlier announcement with a
    /// `replaced` error.
    pub fn register(&self, code: &str, generation: u64) -> bool {
        let mut pending = self.pending.lock().expect("pairing lock poisoned");
        let replaced = pending.is_some();
        if replaced {
            tracing::info!("New pairing code replaces the pending one");
        }
        *pending = Some(PendingPairing {
            code: code.to_string(),
            announced_at: Instant::now(),
            generation,
        });
        replaced
    }

    /// Check a code entered by a client. A verified or expired code is
    /// consumed. A code with no pending announcement is simply unknown;
    /// any code pending for something else stays in place so the user
    /// can retry a typo.
    pub fn verify(&self, code: &str) -> PairingVerdict {
        let mut pending = self.pending.lock().expect("pairing lock poisoned");

        let Some(current) = pending.as_ref() else {
            return PairingVerdict::NoPendingPairing;
        };

        if current.announced_at.elapsed() > self.ttl {
            *pending = None;
            return PairingVerdict::CodeExpired;
        }

        if current.code != code {
            return PairingVerdict::NoPendingPairing;
        }

        *pending = None;
        PairingVerdict::Verified
    }

    /// Drop the pending code if the tunnel that announced it went away
    pub fn handle_disconnect(&self, generation: u64) {
        let mut pending = self.pending.lock().expect("pairing lock poisoned");
        if pending
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false)
        {
            tracing::info!("Pending pairing code discarded with its tunnel");
            *pending = None;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .expect("pairing lock poisoned")
            .is_some()
    }
}
