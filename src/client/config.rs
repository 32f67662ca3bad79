//! Client configuration.
//!
//! [`CarinaClientBuilder`] merges caller overrides onto defaults and validates
//! them once; the resulting [`ClientConfig`] is immutable.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::codec::{CompressionDecision, SizeThreshold};
use crate::core::{
    ConfigError, DEFAULT_COMPRESSION_LEVEL, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REPLY_TIMEOUT,
    DEFAULT_URL, DEFAULT_USER_AGENT, HEADER_AUTHORIZATION, HEADER_IS_BOT, HEADER_USER_AGENT,
    JWT_QUERY_PARAM, PROTOCOL_GZIP, PROTOCOL_PLAIN,
};
use crate::transport::{Connector, ExponentialReconnectionPolicy, Handshake, ReconnectionPolicy};

/// Authentication credential. At most one kind per client.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth token, sent as a bearer `Authorization` header.
    OAuth(String),
    /// Signed JWT, sent as the `jwt` query parameter.
    Jwt(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::OAuth(_) => f.write_str("OAuth(<redacted>)"),
            Credential::Jwt(_) => f.write_str("Jwt(<redacted>)"),
        }
    }
}

/// Resolved client configuration.
pub struct ClientConfig {
    /// Socket endpoint.
    pub url: Url,

    /// User agent sent with the handshake.
    pub user_agent: String,

    /// Identify this client as a bot.
    pub is_bot: bool,

    /// Reconnect after unintentional disconnects.
    pub auto_reconnect: bool,

    /// Outbound compression policy; `None` disables compression.
    pub compression: Option<Arc<dyn CompressionDecision>>,

    /// Gzip level for compressed frames (0-9).
    pub compression_level: u32,

    /// Authentication credential.
    pub credential: Option<Credential>,

    /// Default time to wait for a reply once a call is transmitted.
    pub reply_timeout: Duration,

    /// Maximum decompressed size of an inbound frame.
    pub max_message_size: usize,

    /// Capacity of the public event stream.
    pub event_channel_capacity: usize,

    /// Backoff between reconnect attempts.
    pub(crate) reconnection_policy: Box<dyn ReconnectionPolicy>,

    /// Transport factory.
    pub(crate) connector: Arc<dyn Connector>,
}

impl ClientConfig {
    /// Sub-protocol advertised to the peer.
    pub fn protocol(&self) -> &'static str {
        if self.compression.is_some() {
            PROTOCOL_GZIP
        } else {
            PROTOCOL_PLAIN
        }
    }

    /// Build the handshake for a connection attempt.
    pub fn handshake(&self) -> Handshake {
        let mut url = self.url.clone();
        if let Some(Credential::Jwt(token)) = &self.credential {
            url.query_pairs_mut().append_pair(JWT_QUERY_PARAM, token);
        }

        let mut handshake = Handshake::new(url, self.protocol())
            .header(HEADER_USER_AGENT, self.user_agent.as_str())
            .header(HEADER_IS_BOT, self.is_bot.to_string());

        if let Some(Credential::OAuth(token)) = &self.credential {
            handshake = handshake.header(HEADER_AUTHORIZATION, format!("Bearer {token}"));
        }

        handshake
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url.as_str())
            .field("user_agent", &self.user_agent)
            .field("is_bot", &self.is_bot)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("compression", &self.compression)
            .field("compression_level", &self.compression_level)
            .field("credential", &self.credential)
            .field("reply_timeout", &self.reply_timeout)
            .field("reconnection_policy", &self.reconnection_policy)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ClientConfig`].
pub struct CarinaClientBuilder {
    url: String,
    user_agent: String,
    is_bot: bool,
    auto_reconnect: bool,
    compression: Option<Arc<dyn CompressionDecision>>,
    compression_level: u32,
    oauth_token: Option<String>,
    jwt: Option<String>,
    reply_timeout: Duration,
    max_message_size: usize,
    event_channel_capacity: usize,
    reconnection_policy: Box<dyn ReconnectionPolicy>,
    connector: Option<Arc<dyn Connector>>,
}

impl CarinaClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            is_bot: false,
            auto_reconnect: true,
            compression: Some(Arc::new(SizeThreshold::default())),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            oauth_token: None,
            jwt: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            reconnection_policy: Box::new(ExponentialReconnectionPolicy::default()),
            connector: None,
        }
    }

    /// Set the socket endpoint.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Identify the client as a bot.
    #[must_use]
    pub fn is_bot(mut self, is_bot: bool) -> Self {
        self.is_bot = is_bot;
        self
    }

    /// Enable or disable automatic reconnection.
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the outbound compression policy.
    #[must_use]
    pub fn compression(mut self, decision: impl CompressionDecision + 'static) -> Self {
        self.compression = Some(Arc::new(decision));
        self
    }

    /// Never compress outbound frames.
    #[must_use]
    pub fn no_compression(mut self) -> Self {
        self.compression = None;
        self
    }

    /// Set the gzip level for compressed frames. Values above 9 become 9.
    #[must_use]
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    /// Authenticate with an OAuth token.
    #[must_use]
    pub fn oauth_token(mut self, token: impl Into<String>) -> Self {
        self.oauth_token = Some(token.into());
        self
    }

    /// Authenticate with a signed JWT.
    #[must_use]
    pub fn jwt(mut self, token: impl Into<String>) -> Self {
        self.jwt = Some(token.into());
        self
    }

    /// Set the default reply timeout.
    #[must_use]
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the maximum decompressed size of an inbound frame.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the capacity of the public event stream.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn reconnection_policy(mut self, policy: impl ReconnectionPolicy + 'static) -> Self {
        self.reconnection_policy = Box::new(policy);
        self
    }

    /// Set the transport factory. Required.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let credential = match (self.oauth_token, self.jwt) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingCredentials),
            (Some(token), None) => Some(Credential::OAuth(token)),
            (None, Some(token)) => Some(Credential::Jwt(token)),
            (None, None) => None,
        };
        let connector = self.connector.ok_or(ConfigError::MissingConnector)?;
        let url = Url::parse(&self.url)?;
        self.reconnection_policy.validate()?;

        Ok(ClientConfig {
            url,
            user_agent: self.user_agent,
            is_bot: self.is_bot,
            auto_reconnect: self.auto_reconnect,
            compression: self.compression,
            compression_level: self.compression_level,
            credential,
            reply_timeout: self.reply_timeout,
            max_message_size: self.max_message_size,
            event_channel_capacity: self.event_channel_capacity.max(1),
            reconnection_policy: self.reconnection_policy,
            connector,
        })
    }
}

impl Default for CarinaClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CarinaClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarinaClientBuilder")
            .field("url", &self.url)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("has_connector", &self.connector.is_some())
            .finish_non_exhaustive()
    }
}
