//! Explicit configuration surface for the tunables named in the spec.
//!
//! Kept as a constructible struct rather than scattered constants so a
//! caller (or a test) can override any of them, e.g. to shrink
//! `establish_term_timeout` for a fast test run.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerConfig {
    /// How long `EstablishingTerm` waits for a quorum of promises before
    /// giving up with `establishTermTimeout`. Spec default: 10s.
    pub establish_term_timeout: Duration,

    /// Interval of the periodic `checkPeers` tick that probes live peers not
    /// currently monitored. Spec default: 5s.
    pub check_peers_interval: Duration,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        ProposerConfig {
            establish_term_timeout: Duration::from_secs(10),
            check_peers_interval: Duration::from_secs(5),
        }
    }
}

/// Placeholder for RSM-runtime tunables. Empty for now: every timeout the
/// runtime honors (`syncRevision`'s) is supplied per-request by the caller
/// rather than defaulted here (\S4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RsmConfigTunables;
