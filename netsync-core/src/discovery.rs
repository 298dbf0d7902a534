//! Discovery responder (component C2): answers UDP broadcast probes with a
//! connect string, gated by the application-identity allow-list.
//!
//! Grounded on the Python reference server's `server.py` beacon handling
//! and `client.py`'s probe format (`STYLY-NETSYNC|discover|...`);
//! the older bareword `STYLY-NETSYNC-DISCOVER` form is rejected as legacy,
//! a plain parse failure rather than a special case.

use std::sync::atomic::{AtomicU64, Ordering};

const PROBE_PREFIX: &str = "STYLY-NETSYNC|discover|";

/// A parsed, well-formed discovery probe. Anything that doesn't parse into
/// this shape is dropped silently by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub app_id: String,
    pub proto: u32,
}

/// Parses `STYLY-NETSYNC|discover|appId=<ID>|proto=<N>`. Field order is
/// fixed; anything else, including the legacy bareword probe, is `None`.
pub fn parse_probe(payload: &[u8]) -> Option<Probe> {
    let text = std::str::from_utf8(payload).ok()?;
    let rest = text.strip_prefix(PROBE_PREFIX)?;
    let mut app_id = None;
    let mut proto = None;
    for field in rest.split('|') {
        if let Some(v) = field.strip_prefix("appId=") {
            app_id = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("proto=") {
            proto = v.parse::<u32>().ok();
        }
    }
    Some(Probe {
        app_id: app_id?,
        proto: proto?,
    })
}

/// Byte-exact application-identity allow-list. Empty list disables the
/// gate entirely; a non-empty `appId` always required even when disabled.
#[derive(Debug, Clone, Default)]
pub struct AppIdGate {
    allowed: Vec<String>,
}

impl AppIdGate {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    pub fn permits(&self, app_id: &str) -> bool {
        if app_id.is_empty() {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|a| a == app_id)
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryCounters {
    pub discovery_allowed: AtomicU64,
    pub discovery_denied: AtomicU64,
    pub appid_missing: AtomicU64,
}

/// Stateless responder logic: given a probe payload and the server's gate,
/// decides what (if anything) to reply. The caller owns the UDP socket; this
/// only implements the allow/deny decision.
pub struct DiscoveryResponder {
    gate: AppIdGate,
    dealer_port: u16,
    pub_port: u16,
    server_name: String,
    pub counters: DiscoveryCounters,
}

impl DiscoveryResponder {
    pub fn new(gate: AppIdGate, dealer_port: u16, pub_port: u16, server_name: impl Into<String>) -> Self {
        Self {
            gate,
            dealer_port,
            pub_port,
            server_name: server_name.into(),
            counters: DiscoveryCounters::default(),
        }
    }

    /// Returns the reply string for a raw UDP payload, or `None` if the
    /// probe is malformed or denied. Malformed probes and denials are
    /// distinguished only by counters, never by reply shape.
    pub fn handle(&self, payload: &[u8]) -> Option<String> {
        let probe = match parse_probe(payload) {
            Some(p) => p,
            None => return None,
        };

        if probe.app_id.is_empty() {
            self.counters.appid_missing.fetch_add(1, Ordering::Relaxed);
            self.counters.discovery_denied.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if !self.gate.permits(&probe.app_id) {
            self.counters.discovery_denied.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.counters.discovery_allowed.fetch_add(1, Ordering::Relaxed);
        Some(format!(
            "STYLY-NETSYNC|{}|{}|{}",
            self.dealer_port, self.pub_port, self.server_name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_probe() {
        let probe = parse_probe(b"STYLY-NETSYNC|discover|appId=com.styly.prod|proto=1").unwrap();
        assert_eq!(probe.app_id, "com.styly.prod");
        assert_eq!(probe.proto, 1);
    }

    #[test]
    fn legacy_bareword_probe_is_rejected() {
        assert!(parse_probe(b"STYLY-NETSYNC-DISCOVER").is_none());
    }

    #[test]
    fn malformed_probe_is_dropped_silently() {
        assert!(parse_probe(b"not a probe at all").is_none());
        assert!(parse_probe(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn empty_allow_list_permits_any_non_empty_app_id() {
        let gate = AppIdGate::new(vec![]);
        assert!(gate.permits("anything"));
        assert!(!gate.permits(""));
    }

    #[test]
    fn gated_server_denies_wrong_app_id_and_allows_exact_match() {
        let responder = DiscoveryResponder::new(
            AppIdGate::new(vec!["com.styly.prod".to_string()]),
            5555,
            5556,
            "STYLY-NetSync-Server",
        );
        assert!(responder
            .handle(b"STYLY-NETSYNC|discover|appId=com.other|proto=1")
            .is_none());
        let reply = responder
            .handle(b"STYLY-NETSYNC|discover|appId=com.styly.prod|proto=1")
            .unwrap();
        assert_eq!(reply, "STYLY-NETSYNC|5555|5556|STYLY-NetSync-Server");
        assert_eq!(responder.counters.discovery_allowed.load(Ordering::Relaxed), 1);
        assert_eq!(responder.counters.discovery_denied.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn missing_app_id_increments_appid_missing_counter() {
        let responder = DiscoveryResponder::new(AppIdGate::default(), 5555, 5556, "srv");
        assert!(responder.handle(b"STYLY-NETSYNC|discover|proto=1").is_none());
        assert_eq!(responder.counters.appid_missing.load(Ordering::Relaxed), 1);
    }
}
