//! Parsing of overlay virtual URLs.
//!
//! The overlay name plane follows the grammar
//! `http(s)?://<serviceId>.internal[:<port>]/<path>`. The host is
//! case-insensitive; the path is opaque to the network stack.

use crate::error::CoreError;
use crate::ids::ServiceId;

/// The reserved overlay domain suffix.
pub const INTERNAL_SUFFIX: &str = ".internal";

/// A parsed overlay call target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTarget {
    /// Whether the caller asked for TLS. The overlay transport is the same
    /// either way; the scheme is preserved for pack-visible semantics.
    pub https: bool,
    /// The service addressed by the hostname.
    pub service_id: ServiceId,
    /// Optional explicit port.
    pub port: Option<u16>,
    /// Path plus query string, always starting with `/`.
    pub path: String,
}

impl VirtualTarget {
    /// Parse a full URL such as `http://billing.internal:8080/invoices?x=1`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` when the URL is not an overlay URL:
    /// wrong scheme, host not under `.internal`, bad service label, or a
    /// malformed port.
    pub fn parse_url(url: &str) -> Result<Self, CoreError> {
        let (https, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(CoreError::Invalid(format!(
                "not an http(s) URL: {url}"
            )));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = match authority.rfind(':') {
            Some(idx) => {
                let port = authority[idx + 1..].parse::<u16>().map_err(|_| {
                    CoreError::Invalid(format!("invalid port in {authority}"))
                })?;
                (&authority[..idx], Some(port))
            }
            None => (authority, None),
        };

        let service_id = Self::service_from_host(host)?;

        Ok(Self {
            https,
            service_id,
            port,
            path,
        })
    }

    /// Extract the service ID from an overlay hostname, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the host is not `<label>.internal` or
    /// the label is not a valid service ID.
    pub fn service_from_host(host: &str) -> Result<ServiceId, CoreError> {
        let lowered = host.to_ascii_lowercase();
        let label = lowered.strip_suffix(INTERNAL_SUFFIX).ok_or_else(|| {
            CoreError::Invalid(format!("host {host} is not under {INTERNAL_SUFFIX}"))
        })?;
        label
            .parse()
            .map_err(|e| CoreError::Invalid(format!("invalid service in host {host}: {e}")))
    }

    /// Whether a hostname belongs to the overlay name plane at all.
    #[must_use]
    pub fn is_overlay_host(host: &str) -> bool {
        host.to_ascii_lowercase().ends_with(INTERNAL_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_url() {
        let target = VirtualTarget::parse_url("http://billing.internal/invoices").unwrap();
        assert!(!target.https);
        assert_eq!(target.service_id.as_str(), "billing");
        assert_eq!(target.port, None);
        assert_eq!(target.path, "/invoices");
    }

    #[test]
    fn parses_port_query_and_https() {
        let target =
            VirtualTarget::parse_url("https://Billing.INTERNAL:8443/v1/run?x=1&y=2").unwrap();
        assert!(target.https);
        assert_eq!(target.service_id.as_str(), "billing");
        assert_eq!(target.port, Some(8443));
        assert_eq!(target.path, "/v1/run?x=1&y=2");
    }

    #[test]
    fn bare_host_gets_root_path() {
        let target = VirtualTarget::parse_url("http://b.internal").unwrap();
        assert_eq!(target.path, "/");
    }

    #[test]
    fn rejects_non_internal_host() {
        let result = VirtualTarget::parse_url("http://example.com/x");
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }

    #[test]
    fn rejects_other_schemes() {
        let result = VirtualTarget::parse_url("ftp://b.internal/x");
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_port() {
        let result = VirtualTarget::parse_url("http://b.internal:99999/x");
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }

    #[test]
    fn overlay_host_predicate() {
        assert!(VirtualTarget::is_overlay_host("b.internal"));
        assert!(VirtualTarget::is_overlay_host("B.Internal"));
        assert!(!VirtualTarget::is_overlay_host("b.example.com"));
    }
}
