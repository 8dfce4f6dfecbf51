use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_nats::HeaderMap;
use mqrpc_broker::MessageProperties;

pub const CONTENT_TYPE: &str = "Mqrpc-Content-Type";
pub const CORRELATION_ID: &str = "Mqrpc-Correlation-Id";
pub const EXPIRATION: &str = "Mqrpc-Expiration";
pub const EXPIRES_AT: &str = "Mqrpc-Expires-At";
pub const REDELIVERED: &str = "Mqrpc-Redelivered";
pub const REPLY_TO: &str = "Mqrpc-Reply-To";
pub const TIMESTAMP: &str = "Mqrpc-Timestamp";
pub const USER_ID: &str = "Mqrpc-User-Id";

const RESERVED_PREFIX: &str = "Mqrpc-";

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Encodes message properties as NATS headers.
///
/// The expiration is also pinned to an absolute time so that consumers can
/// drop stale messages.
pub fn encode(properties: &MessageProperties) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (key, value) in &properties.headers {
        if !key.starts_with(RESERVED_PREFIX) {
            headers.append(key.as_str(), value.as_str());
        }
    }

    let optional = [
        (CONTENT_TYPE, &properties.content_type),
        (CORRELATION_ID, &properties.correlation_id),
        (EXPIRATION, &properties.expiration),
        (REPLY_TO, &properties.reply_to),
        (USER_ID, &properties.user_id),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            headers.insert(key, value.as_str());
        }
    }

    if let Some(timestamp) = properties.timestamp {
        headers.insert(TIMESTAMP, timestamp.to_string());
    }

    if let Some(ttl) = properties.expiration_duration() {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        headers.insert(EXPIRES_AT, unix_millis().saturating_add(ttl).to_string());
    }

    headers
}

/// Decodes message properties from NATS headers.
pub fn decode(headers: Option<&HeaderMap>) -> MessageProperties {
    let mut properties = MessageProperties::default();
    let Some(headers) = headers else {
        return properties;
    };

    let get = |key: &str| headers.get(key).map(|v| v.as_str().to_string());
    properties.content_type = get(CONTENT_TYPE);
    properties.correlation_id = get(CORRELATION_ID);
    properties.expiration = get(EXPIRATION);
    properties.reply_to = get(REPLY_TO);
    properties.timestamp = get(TIMESTAMP).and_then(|t| t.parse().ok());
    properties.user_id = get(USER_ID);

    for (name, values) in headers.iter() {
        let name = name.to_string();
        if name.starts_with(RESERVED_PREFIX) {
            continue;
        }
        for value in values {
            properties
                .headers
                .push((name.clone(), value.as_str().to_string()));
        }
    }

    properties
}

/// Whether the message was put back after a rejection.
pub fn is_redelivered(headers: Option<&HeaderMap>) -> bool {
    headers
        .and_then(|h| h.get(REDELIVERED))
        .is_some_and(|v| v.as_str() == "true")
}

/// Time left before the message expires, `None` if it never does.
pub fn time_to_live(headers: Option<&HeaderMap>) -> Option<Duration> {
    let expires_at: u64 = headers?.get(EXPIRES_AT)?.as_str().parse().ok()?;
    Some(Duration::from_millis(expires_at.saturating_sub(unix_millis())))
}
