use crate::error::{Error, Result};
use crate::status::Status;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Ordered key/value pairs carried alongside a body.
pub type Headers = Vec<(String, String)>;

fn find_header<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Envelopes travel as CBOR maps.
trait CborEnvelope: Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn to_cbor(&self) -> Result<Bytes> {
        let mut writer = BytesMut::new().writer();
        ciborium::ser::into_writer(self, &mut writer)
            .map_err(|e| Error::SerializationFailed(format!("{} envelope: {e}", Self::KIND)))?;
        Ok(writer.into_inner().freeze())
    }

    fn from_cbor(data: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(data).map_err(|e| Error::MalformedEnvelope {
            kind: Self::KIND,
            reason: e.to_string(),
        })
    }
}

impl CborEnvelope for RequestEnvelope {
    const KIND: &'static str = "request";
}

impl CborEnvelope for ResponseEnvelope {
    const KIND: &'static str = "response";
}

/// A call request as carried in a broker message body.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Target service.
    pub service_name: String,

    /// Full dotted method name, e.g. `Greet.SayHello`.
    pub method_name: String,

    /// Serialized request message.
    pub body: Bytes,

    /// Request headers.
    pub headers: Headers,
}

impl RequestEnvelope {
    /// Creates a request envelope without headers.
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// First header with the given key, ignoring case.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// Encodes the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        self.to_cbor()
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a request envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::from_cbor(data)
    }
}

/// A call response as carried in a broker message body.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Serialized response message. Absent on failure.
    pub body: Option<Bytes>,

    /// Outcome of the call.
    pub status: Status,

    /// Response headers.
    pub headers: Headers,
}

impl ResponseEnvelope {
    /// A successful response.
    pub fn success(body: impl Into<Bytes>) -> Self {
        Self {
            body: Some(body.into()),
            status: Status::ok(),
            headers: Headers::new(),
        }
    }

    /// A failed response with no body.
    #[must_use]
    pub const fn failure(status: Status) -> Self {
        Self {
            body: None,
            status,
            headers: Headers::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// First header with the given key, ignoring case.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }

    /// Encodes the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        self.to_cbor()
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a response envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::from_cbor(data)
    }
}
