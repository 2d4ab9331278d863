//! Shared Access Signature helpers.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AmqpError, Result};
use crate::tick::epoch_now_secs;

type HmacSha256 = Hmac<Sha256>;

/// Creates a SAS token valid for `expiry` from now.
///
/// `scope` and `key_name` are given unencoded; both are URL-encoded into the token.
pub fn create_sas_token(key_name: &str, key: &[u8], scope: &str, expiry: Duration) -> Result<String> {
    let expires_at = epoch_now_secs().saturating_add(expiry.as_secs());
    create_sas_token_at(key_name, key, scope, expires_at)
}

/// Creates a SAS token expiring at `expires_at` (seconds since epoch).
///
/// Format: `SharedAccessSignature sr=<scope>&sig=<signature>&se=<expiry>&skn=<key_name>`
/// where the signature is HMAC-SHA256 over `"<scope>\n<expiry>"`, base64 and URL encoded.
pub fn create_sas_token_at(key_name: &str, key: &[u8], scope: &str, expires_at: u64) -> Result<String> {
    if key_name.is_empty() {
        return Err(AmqpError::InvalidArgument("key name must not be empty".to_string()));
    }
    let encoded_scope = urlencoding::encode(scope);
    let encoded_name = urlencoding::encode(key_name);
    let string_to_sign = format!("{}\n{}", encoded_scope, expires_at);

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AmqpError::InvalidArgument(format!("invalid signing key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_scope,
        urlencoding::encode(&signature),
        expires_at,
        encoded_name
    ))
}

/// Parses a `Key=Value;Key=Value` connection string.
///
/// Empty segments (a trailing `;`) are skipped. A segment without `=` is rejected.
pub fn parse_connection_string(connect_str: &str) -> Result<HashMap<String, String>> {
    let mut info = HashMap::new();
    for field in connect_str.split(';') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, value) = field.split_once('=').ok_or_else(|| {
            AmqpError::InvalidArgument(format!("malformed connection string field: {:?}", field))
        })?;
        info.insert(key.to_string(), value.to_string());
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        let token = create_sas_token_at("RootManageSharedAccessKey", b"secret", "sb://ns.example.net/hub", 1_700_000_000).unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=sb%3A%2F%2Fns.example.net%2Fhub&sig="));
        assert!(token.contains("&se=1700000000&"));
        assert!(token.ends_with("&skn=RootManageSharedAccessKey"));
    }

    #[test]
    fn test_token_signature_deterministic() {
        let a = create_sas_token_at("key", b"secret", "scope", 42).unwrap();
        let b = create_sas_token_at("key", b"secret", "scope", 42).unwrap();
        let c = create_sas_token_at("key", b"other", "scope", 42).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signature_matches_hmac() {
        let token = create_sas_token_at("key", b"secret", "scope", 42).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"scope\n42");
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        assert!(token.contains(&format!("sig={}", urlencoding::encode(&expected))));
    }

    #[test]
    fn test_token_relative_expiry() {
        let before = epoch_now_secs();
        let token = create_sas_token("key", b"secret", "scope", Duration::from_secs(3600)).unwrap();
        let se: u64 = token
            .split('&')
            .find_map(|part| part.strip_prefix("se="))
            .unwrap()
            .parse()
            .unwrap();
        assert!(se >= before + 3600 && se <= before + 3602);
    }

    #[test]
    fn test_empty_key_name_rejected() {
        assert!(matches!(
            create_sas_token_at("", b"secret", "scope", 1),
            Err(AmqpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_connection_string() {
        let info = parse_connection_string(
            "Endpoint=sb://ns.example.net/;SharedAccessKeyName=root;SharedAccessKey=abc=;EntityPath=hub",
        )
        .unwrap();
        assert_eq!(info["Endpoint"], "sb://ns.example.net/");
        assert_eq!(info["SharedAccessKeyName"], "root");
        assert_eq!(info["SharedAccessKey"], "abc=");
        assert_eq!(info["EntityPath"], "hub");
    }

    #[test]
    fn test_parse_connection_string_errors() {
        assert!(parse_connection_string("Endpoint=x;;").is_ok());
        assert!(matches!(
            parse_connection_string("Endpoint=x;garbage"),
            Err(AmqpError::InvalidArgument(_))
        ));
    }
}
