//! Identity Resolver (C3)
//!
//! Maps an inbound request to a stable identity token without ever
//! blending a client-supplied fingerprint with a network address. The
//! token's prefix is the namespace for every downstream KV key, so a
//! spoofed fingerprint header can never collide with — or pollute —
//! an address-based counter.

use std::net::SocketAddr;
use uuid::Uuid;

/// Opaque identity token. Either `fp:<uuid>:<hex>` (fingerprint form) or
/// `addr:<canonicalized address>` (network form).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken(String);

impl IdentityToken {
    const FINGERPRINT_PREFIX: &'static str = "fp:";
    const ADDRESS_PREFIX: &'static str = "addr:";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fingerprint(&self) -> bool {
        self.0.starts_with(Self::FINGERPRINT_PREFIX)
    }

    /// Returns the challenge ID embedded in a fingerprint-form token, if
    /// this is one. The anchor need not equal this value — see
    /// `IdentityResolver::resolve`'s doc comment.
    pub fn challenge_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(Self::FINGERPRINT_PREFIX)
            .and_then(|rest| rest.split(':').next())
    }

    fn fingerprint(raw: &str) -> Self {
        Self(raw.to_string())
    }

    fn address(canonical: &str) -> Self {
        Self(format!("{}{}", Self::ADDRESS_PREFIX, canonical))
    }

    /// Test helper: builds a fingerprint-form token for a given challenge
    /// ID without needing a well-formed UUID/hex pair (gate/rate-limiter
    /// tests only care about the identity namespace, not header parsing).
    #[cfg(test)]
    pub fn for_test_fingerprint(challenge_id: &str) -> Self {
        Self(format!("fp:{challenge_id}:{}", "a".repeat(32)))
    }

    #[cfg(test)]
    pub fn for_test_address(addr: &str) -> Self {
        Self::address(addr)
    }
}

impl std::fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates and resolves identity tokens. Holds no state beyond the
/// configured set of proxy headers trusted to carry the real client
/// address — resolution itself is a pure function of its inputs
/// (testable property 6 in spec.md §8).
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    trusted_proxy_headers: Vec<String>,
}

impl IdentityResolver {
    pub fn new(trusted_proxy_headers: Vec<String>) -> Self {
        Self {
            trusted_proxy_headers,
        }
    }

    /// Resolves the identity for one request.
    ///
    /// `fingerprint_header` is the raw `X-Fingerprint` header value, if
    /// present. `header_lookup` is called with each configured trusted
    /// proxy header name, in priority order, to find a forwarded
    /// address; the resolver does not know about HTTP directly so
    /// callers (the axum extractor) supply this as a closure.
    /// `peer_addr` is the raw transport-layer peer address, used when no
    /// trusted header yields one.
    pub fn resolve(
        &self,
        fingerprint_header: Option<&str>,
        header_lookup: impl Fn(&str) -> Option<String>,
        peer_addr: SocketAddr,
    ) -> IdentityToken {
        if let Some(raw) = fingerprint_header {
            if Self::is_well_formed_fingerprint(raw) {
                return IdentityToken::fingerprint(raw);
            }
            // Malformed fingerprint header: ignored, treated as absent.
        }

        for header in &self.trusted_proxy_headers {
            if let Some(value) = header_lookup(header) {
                if let Some(addr) = Self::first_address(&value) {
                    return IdentityToken::address(&addr);
                }
            }
        }

        IdentityToken::address(&peer_addr.ip().to_string())
    }

    /// `fp:<uuid-v4>:<hex-hash>` where the hex hash is at least 32
    /// characters (128 bits) of lowercase or uppercase hex.
    fn is_well_formed_fingerprint(raw: &str) -> bool {
        let Some(rest) = raw.strip_prefix("fp:") else {
            return false;
        };
        let mut parts = rest.splitn(2, ':');
        let (Some(uuid_part), Some(hex_part)) = (parts.next(), parts.next()) else {
            return false;
        };

        let Ok(uuid) = Uuid::parse_str(uuid_part) else {
            return false;
        };
        if uuid.get_version_num() != 4 {
            return false;
        }

        hex_part.len() >= 32 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// `X-Forwarded-For`-style headers may carry a comma-separated
    /// chain; the first entry is the original client.
    fn first_address(value: &str) -> Option<String> {
        let candidate = value.split(',').next()?.trim();
        if candidate.is_empty() {
            None
        } else {
            Some(candidate.to_string())
        }
    }
}
