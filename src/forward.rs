//! Raw content forwarding with TLS fingerprint emulation
//!
//! Backs `GET /content`: the caller's `User-Agent` and `Cookie` headers are
//! replayed against an arbitrary URL with a browser-like TLS handshake, and
//! the body comes back as text. No backend or session is involved.

use serde::Serialize;
use strum::VariantArray;
use tracing::{debug, error};
use wreq::{
    header::{COOKIE, USER_AGENT},
    Client,
};
use wreq_util::Emulation;

use crate::error::ApiError;

/// Parse a TLS profile name such as `chrome_131` or `firefox_139`.
///
/// Returns the offending name when it matches no profile.
pub fn parse_tls_profile(profile: &str) -> Result<Emulation, String> {
    serde_json::from_value(serde_json::Value::String(profile.to_string()))
        .map_err(|_| profile.to_string())
}

/// Every profile name wreq-util knows about.
pub fn available_profiles() -> Vec<String> {
    Emulation::VARIANTS
        .iter()
        .filter_map(|e| match serde_json::to_value(e) {
            Ok(serde_json::Value::String(name)) => Some(name),
            _ => None,
        })
        .collect()
}

/// Latest Chrome
pub fn default_profile() -> Emulation {
    Emulation::default()
}

/// Headers replayed against the target
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ForwardedHeaders {
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
    #[serde(rename = "Cookie")]
    pub cookie: String,
}

/// What the target answered
#[derive(Debug)]
pub struct Forwarded {
    pub status: u16,
    pub body: String,
}

/// Fetch `target_url` with the given headers.
pub async fn forward(
    profile: Emulation,
    target_url: &str,
    headers: &ForwardedHeaders,
) -> Result<Forwarded, ApiError> {
    let client = Client::builder().emulation(profile).build().map_err(|e| {
        error!(error = %e, "Failed to build forwarding client");
        ApiError::forwarding(format!("Failed to build client: {}", e))
    })?;

    let response = client
        .get(target_url)
        .header(USER_AGENT, headers.user_agent.as_str())
        .header(COOKIE, headers.cookie.as_str())
        .send()
        .await
        .map_err(|e| ApiError::forwarding(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::forwarding(format!("Failed to read response body: {}", e)))?;

    debug!(status, body_size = body.len(), "Forwarded content");
    Ok(Forwarded { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_profiles() {
        assert!(parse_tls_profile("chrome_131").is_ok());
        assert!(parse_tls_profile("firefox_139").is_ok());
    }

    #[test]
    fn test_parse_unknown_profile_returns_name() {
        assert_eq!(parse_tls_profile("mosaic_1").unwrap_err(), "mosaic_1");
    }

    #[test]
    fn test_profiles_cover_major_browsers() {
        let profiles = available_profiles();
        assert!(profiles.iter().any(|p| p.starts_with("chrome_")));
        assert!(profiles.iter().any(|p| p.starts_with("firefox_")));
    }

    #[test]
    fn test_forwarded_headers_wire_names() {
        let headers = ForwardedHeaders {
            user_agent: "Mozilla/5.0".into(),
            cookie: "a=b".into(),
        };
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["User-Agent"], "Mozilla/5.0");
        assert_eq!(json["Cookie"], "a=b");
    }
}
