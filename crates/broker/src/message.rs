use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Transport properties attached to a message.
///
/// Mirrors the basic properties of AMQP: the RPC runtime uses `correlation_id`
/// and `reply_to` to route replies, and `expiration` (milliseconds, as a
/// decimal string) to carry the caller's deadline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type of the body.
    pub content_type: Option<String>,

    /// Ties a reply to the request that caused it.
    pub correlation_id: Option<String>,

    /// Time to live in milliseconds.
    pub expiration: Option<String>,

    /// Application headers.
    pub headers: Vec<(String, String)>,

    /// Queue replies should be published to.
    pub reply_to: Option<String>,

    /// Seconds since the unix epoch.
    pub timestamp: Option<u64>,

    /// Identity of the publisher.
    pub user_id: Option<String>,
}

impl MessageProperties {
    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the time to live, rounded up to whole milliseconds.
    #[must_use]
    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        let mut millis = ttl.as_millis();
        if ttl.subsec_nanos() % 1_000_000 != 0 {
            millis += 1;
        }
        self.expiration = Some(millis.to_string());
        self
    }

    /// Adds an application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Stamps the message with the current time.
    #[must_use]
    pub fn with_timestamp_now(mut self) -> Self {
        self.timestamp = Some(unix_now());
        self
    }

    /// Sets the publisher identity.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Parses the expiration property.
    ///
    /// Returns `None` when absent or not a whole number of milliseconds.
    #[must_use]
    pub fn expiration_duration(&self) -> Option<Duration> {
        self.expiration
            .as_deref()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    /// Looks up the first header with the given key.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// A message as published to or consumed from a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Opaque payload.
    pub body: Bytes,

    /// Transport properties.
    pub properties: MessageProperties,
}

impl Message {
    /// Creates a message with default properties.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    /// Replaces the properties.
    #[must_use]
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_rounds_up_partial_millis() {
        let props = MessageProperties::default().with_expiration(Duration::from_micros(1500));
        assert_eq!(props.expiration.as_deref(), Some("2"));
        assert_eq!(props.expiration_duration(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn test_expiration_whole_millis() {
        let props = MessageProperties::default().with_expiration(Duration::from_secs(2));
        assert_eq!(props.expiration.as_deref(), Some("2000"));
    }

    #[test]
    fn test_bad_expiration_is_ignored() {
        let props = MessageProperties {
            expiration: Some("soon".to_string()),
            ..Default::default()
        };
        assert_eq!(props.expiration_duration(), None);
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let props = MessageProperties::default().with_header("Grpc-Encoding", "gzip");
        assert_eq!(props.header("grpc-encoding"), Some("gzip"));
        assert_eq!(props.header("missing"), None);
    }
}
