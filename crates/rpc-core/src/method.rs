use crate::error::Result;
use crate::marshaller::{self, Marshaller};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Cardinality of a method's requests and responses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MethodKind {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStreaming,
    /// One request, many responses.
    ServerStreaming,
    /// Many requests, many responses.
    Duplex,
}

/// Untyped description of a method.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MethodDescriptor {
    full_name: String,
    kind: MethodKind,
    name: String,
    service_name: String,
}

impl MethodDescriptor {
    /// Creates a descriptor. The full name is `service.name`.
    pub fn new(kind: MethodKind, service_name: impl Into<String>, name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let name = name.into();

        Self {
            full_name: format!("{service_name}.{name}"),
            kind,
            name,
            service_name,
        }
    }

    /// Dotted `service.method` name carried in request envelopes.
    #[must_use]
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Call kind.
    #[must_use]
    pub const fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Bare method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// A typed method: its descriptor plus request and response marshallers.
///
/// Immutable once built and cheap to clone; servers and clients share the
/// same definition.
pub struct Method<Req, Res> {
    descriptor: MethodDescriptor,
    request_marshaller: Arc<dyn Marshaller<Req>>,
    response_marshaller: Arc<dyn Marshaller<Res>>,
}

impl<Req: 'static, Res: 'static> Method<Req, Res> {
    /// Creates a method.
    pub fn new(
        kind: MethodKind,
        service_name: impl Into<String>,
        name: impl Into<String>,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Res>,
    ) -> Self {
        Self {
            descriptor: MethodDescriptor::new(kind, service_name, name),
            request_marshaller: Arc::new(request_marshaller),
            response_marshaller: Arc::new(response_marshaller),
        }
    }

    /// Creates a unary method.
    pub fn unary(
        service_name: impl Into<String>,
        name: impl Into<String>,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Res>,
    ) -> Self {
        Self::new(
            MethodKind::Unary,
            service_name,
            name,
            request_marshaller,
            response_marshaller,
        )
    }

    /// The untyped descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Call kind.
    #[must_use]
    pub const fn kind(&self) -> MethodKind {
        self.descriptor.kind
    }

    /// Service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.descriptor.service_name()
    }

    /// Bare method name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// Dotted `service.method` name.
    #[must_use]
    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    /// Request marshaller.
    #[must_use]
    pub fn request_marshaller(&self) -> &Arc<dyn Marshaller<Req>> {
        &self.request_marshaller
    }

    /// Response marshaller.
    #[must_use]
    pub fn response_marshaller(&self) -> &Arc<dyn Marshaller<Res>> {
        &self.response_marshaller
    }

    /// Serializes a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request marshaller fails.
    pub fn serialize_request(&self, request: &Req) -> Result<Bytes> {
        marshaller::serialize(self.request_marshaller.as_ref(), request)
    }

    /// Deserializes a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request marshaller fails.
    pub fn deserialize_request(&self, payload: Bytes) -> Result<Req> {
        marshaller::deserialize(self.request_marshaller.as_ref(), payload)
    }

    /// Serializes a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response marshaller fails.
    pub fn serialize_response(&self, response: &Res) -> Result<Bytes> {
        marshaller::serialize(self.response_marshaller.as_ref(), response)
    }

    /// Deserializes a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the response marshaller fails.
    pub fn deserialize_response(&self, payload: Bytes) -> Result<Res> {
        marshaller::deserialize(self.response_marshaller.as_ref(), payload)
    }
}

impl<Req, Res> Clone for Method<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            request_marshaller: Arc::clone(&self.request_marshaller),
            response_marshaller: Arc::clone(&self.response_marshaller),
        }
    }
}

impl<Req, Res> fmt::Debug for Method<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
