//! Connection authentication descriptors.
//!
//! SASL mechanisms are negotiated by the transport engine. SAS tokens are
//! negotiated after the connection opens, over the CBS node, by
//! [`CbsAuthenticator`](crate::cbs::CbsAuthenticator).

use std::fmt;
use std::time::Duration;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::Address;
use crate::config::CbsConfig;
use crate::constants::{AUTH_EXPIRATION_SECS, AUTH_REFRESH_SECS, AUTH_TIMEOUT_SECS, SAS_TOKEN_TYPE};
use crate::error::{AmqpError, Result};
use crate::retry::TokenRetryPolicy;
use crate::sas::create_sas_token_at;
use crate::tick::epoch_now_secs;

/// A secret string, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// How a connection authenticates.
#[derive(Debug, Clone)]
pub enum Auth {
    /// SASL with no credentials.
    SaslAnonymous,
    /// SASL PLAIN with a username and password.
    SaslPlain { username: String, password: Secret },
    /// SASL anonymous, followed by a CBS token negotiation.
    SasToken(SasTokenAuth),
}

impl Auth {
    /// SASL-Plain when the address carries credentials, otherwise anonymous.
    pub fn from_address(address: &Address) -> Self {
        match (address.username(), address.password()) {
            (Some(username), Some(password)) => Auth::SaslPlain {
                username: username.to_string(),
                password: Secret::new(password),
            },
            _ => Auth::SaslAnonymous,
        }
    }

    pub fn sasl_plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::SaslPlain {
            username: username.into(),
            password: Secret::new(password),
        }
    }

    /// Returns true if this auth needs a CBS authenticator on the connection.
    pub fn uses_cbs(&self) -> bool {
        matches!(self, Auth::SasToken(_))
    }

    /// Mechanism name, for logging.
    pub fn mechanism(&self) -> &'static str {
        match self {
            Auth::SaslAnonymous => "ANONYMOUS",
            Auth::SaslPlain { .. } => "PLAIN",
            Auth::SasToken(_) => "CBS",
        }
    }
}

/// Token lifetime, either relative or absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenExpiry {
    /// Valid for this long from creation.
    ExpiresIn(Duration),
    /// Valid until this time, in seconds since the epoch.
    ExpiresAt(u64),
}

/// CBS authentication with a Shared Access Signature token.
#[derive(Debug, Clone)]
pub struct SasTokenAuth {
    audience: String,
    uri: String,
    hostname: String,
    port: u16,
    token: Secret,
    token_type: String,
    expires_in: Duration,
    expires_at: u64,
    username: Option<String>,
    password: Option<Secret>,
    timeout: Duration,
    refresh_window: Duration,
    retry_policy: TokenRetryPolicy,
}

impl SasTokenAuth {
    /// Creates token auth for `audience` on the endpoint at `uri`.
    ///
    /// Username and password default from the URI's userinfo.
    pub fn new(audience: impl Into<String>, uri: &str, token: impl Into<String>, expiry: TokenExpiry) -> Result<Self> {
        let address = Address::parse(uri)?;
        let now = epoch_now_secs();
        let (expires_in, expires_at) = match expiry {
            TokenExpiry::ExpiresIn(expires_in) => (expires_in, now.saturating_add(expires_in.as_secs())),
            TokenExpiry::ExpiresAt(expires_at) => {
                if expires_at < now.saturating_add(1) {
                    return Err(AmqpError::InvalidArgument("token has already expired".to_string()));
                }
                (Duration::from_secs(expires_at - now), expires_at)
            }
        };

        Ok(Self {
            audience: audience.into(),
            uri: uri.to_string(),
            hostname: address.hostname().to_string(),
            port: address.port(),
            token: Secret::new(token),
            token_type: SAS_TOKEN_TYPE.to_string(),
            expires_in,
            expires_at,
            username: address.username().map(str::to_string),
            password: address.password().map(Secret::new),
            timeout: Duration::from_secs(AUTH_TIMEOUT_SECS),
            refresh_window: Duration::from_secs(AUTH_REFRESH_SECS),
            retry_policy: TokenRetryPolicy::default(),
        })
    }

    /// Generates a token from a shared access key. The key name and key are kept
    /// so the token can be refreshed.
    pub fn from_shared_access_key(uri: &str, key_name: &str, key: &str, expiry: Option<Duration>) -> Result<Self> {
        let expires_in = expiry.unwrap_or(Duration::from_secs(AUTH_EXPIRATION_SECS));
        let expires_at = epoch_now_secs().saturating_add(expires_in.as_secs());
        let token = create_sas_token_at(key_name, key.as_bytes(), uri, expires_at)?;
        Ok(Self::new(uri, uri, token, TokenExpiry::ExpiresIn(expires_in))?.with_credentials(key_name, key))
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: TokenRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Applies timeout, refresh window and retry policy from config.
    pub fn with_cbs_config(self, config: &CbsConfig) -> Self {
        self.with_timeout(Duration::from_millis(config.auth_timeout_ms))
            .with_refresh_window(Duration::from_secs(config.refresh_window_secs))
            .with_retry_policy(config.retry.clone())
    }

    /// Regenerates the token from the stored key name and key.
    ///
    /// Fails with `TokenExpired` when no credentials are available.
    pub fn update_token(&mut self) -> Result<()> {
        let (username, password) = match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.expose().is_empty() => (u.clone(), p.clone()),
            _ => {
                return Err(AmqpError::TokenExpired {
                    reason: "unable to refresh token: no username or password".to_string(),
                })
            }
        };
        let expires_at = epoch_now_secs().saturating_add(self.expires_in.as_secs());
        let token = create_sas_token_at(&username, password.expose().as_bytes(), &self.uri, expires_at)?;
        self.token = Secret::new(token);
        self.expires_at = expires_at;
        Ok(())
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        self.token.expose()
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Absolute expiry, seconds since epoch.
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn refresh_window(&self) -> Duration {
        self.refresh_window
    }

    pub fn retry_policy(&self) -> &TokenRetryPolicy {
        &self.retry_policy
    }
}
