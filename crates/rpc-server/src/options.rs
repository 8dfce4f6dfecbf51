use crate::error::{Error, Result};
use crate::interceptor::InterceptorRegistration;

use std::fmt;
use std::sync::Arc;

use mqrpc_core::compression::{self, CompressionLevel, CompressionProvider};
use mqrpc_core::protocol::DEFAULT_MAX_RECEIVE_MESSAGE_SIZE;

/// Options for all services, or for one service.
///
/// Unset values fall through to the next layer when resolved into
/// [`MethodOptions`].
#[derive(Clone, Default)]
pub struct ServiceOptions {
    compression_providers: Option<Vec<Arc<dyn CompressionProvider>>>,
    enable_detailed_errors: Option<bool>,
    interceptors: Vec<Arc<InterceptorRegistration>>,
    max_receive_message_size: Option<Option<usize>>,
    max_send_message_size: Option<Option<usize>>,
    response_compression_algorithm: Option<String>,
    response_compression_level: Option<CompressionLevel>,
}

impl ServiceOptions {
    /// Empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor. Interceptors run in the order they are added.
    #[must_use]
    pub fn with_interceptor(mut self, registration: InterceptorRegistration) -> Self {
        self.interceptors.push(Arc::new(registration));
        self
    }

    /// Replaces the compression providers.
    #[must_use]
    pub fn with_compression_providers(
        mut self,
        providers: Vec<Arc<dyn CompressionProvider>>,
    ) -> Self {
        self.compression_providers = Some(providers);
        self
    }

    /// Includes handler panic messages in fault statuses.
    #[must_use]
    pub const fn with_detailed_errors(mut self, enabled: bool) -> Self {
        self.enable_detailed_errors = Some(enabled);
        self
    }

    /// Largest request body accepted. `None` lifts the limit.
    #[must_use]
    pub const fn with_max_receive_message_size(mut self, size: Option<usize>) -> Self {
        self.max_receive_message_size = Some(size);
        self
    }

    /// Largest response body sent. `None` lifts the limit.
    #[must_use]
    pub const fn with_max_send_message_size(mut self, size: Option<usize>) -> Self {
        self.max_send_message_size = Some(size);
        self
    }

    /// Compresses responses with `algorithm` when the caller accepts it.
    #[must_use]
    pub fn with_response_compression(
        mut self,
        algorithm: impl Into<String>,
        level: Option<CompressionLevel>,
    ) -> Self {
        self.response_compression_algorithm = Some(algorithm.into());
        self.response_compression_level = level;
        self
    }
}

impl fmt::Debug for ServiceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceOptions")
            .field("interceptors", &self.interceptors.len())
            .field("enable_detailed_errors", &self.enable_detailed_errors)
            .field("max_receive_message_size", &self.max_receive_message_size)
            .field("max_send_message_size", &self.max_send_message_size)
            .field(
                "response_compression_algorithm",
                &self.response_compression_algorithm,
            )
            .finish_non_exhaustive()
    }
}

/// Options resolved once per method. Immutable.
pub struct MethodOptions {
    compression_providers: Vec<Arc<dyn CompressionProvider>>,
    enable_detailed_errors: bool,
    interceptors: Vec<Arc<InterceptorRegistration>>,
    max_receive_message_size: Option<usize>,
    max_send_message_size: Option<usize>,
    response_compression_algorithm: Option<String>,
    response_compression_level: Option<CompressionLevel>,
}

impl MethodOptions {
    /// Merges option layers, most general first.
    ///
    /// Interceptors accumulate in layer order. Every other setting is taken
    /// from the last layer that sets it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCompressionAlgorithm`] if the response
    /// compression algorithm has no provider.
    pub fn create<'a>(layers: impl IntoIterator<Item = &'a ServiceOptions>) -> Result<Self> {
        let mut compression_providers = None;
        let mut enable_detailed_errors = false;
        let mut interceptors = Vec::new();
        let mut max_receive_message_size = Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE);
        let mut max_send_message_size = None;
        let mut response_compression_algorithm = None;
        let mut response_compression_level = None;

        for layer in layers {
            interceptors.extend(layer.interceptors.iter().cloned());

            if let Some(providers) = &layer.compression_providers {
                compression_providers = Some(providers.clone());
            }
            if let Some(enabled) = layer.enable_detailed_errors {
                enable_detailed_errors = enabled;
            }
            if let Some(size) = layer.max_receive_message_size {
                max_receive_message_size = size;
            }
            if let Some(size) = layer.max_send_message_size {
                max_send_message_size = size;
            }
            if let Some(algorithm) = &layer.response_compression_algorithm {
                response_compression_algorithm = Some(algorithm.clone());
            }
            if let Some(level) = layer.response_compression_level {
                response_compression_level = Some(level);
            }
        }

        let compression_providers =
            compression_providers.unwrap_or_else(compression::default_providers);

        if let Some(algorithm) = &response_compression_algorithm {
            if compression::find_provider(&compression_providers, algorithm).is_none() {
                return Err(Error::UnknownCompressionAlgorithm(algorithm.clone()));
            }
        }

        Ok(Self {
            compression_providers,
            enable_detailed_errors,
            interceptors,
            max_receive_message_size,
            max_send_message_size,
            response_compression_algorithm,
            response_compression_level,
        })
    }

    /// Available compression providers.
    #[must_use]
    pub fn compression_providers(&self) -> &[Arc<dyn CompressionProvider>] {
        &self.compression_providers
    }

    /// Whether fault statuses carry handler panic messages.
    #[must_use]
    pub const fn enable_detailed_errors(&self) -> bool {
        self.enable_detailed_errors
    }

    /// Interceptors, outermost first.
    #[must_use]
    pub fn interceptors(&self) -> &[Arc<InterceptorRegistration>] {
        &self.interceptors
    }

    /// Whether any interceptors are configured.
    #[must_use]
    pub fn has_interceptors(&self) -> bool {
        !self.interceptors.is_empty()
    }

    /// Largest request body accepted.
    #[must_use]
    pub const fn max_receive_message_size(&self) -> Option<usize> {
        self.max_receive_message_size
    }

    /// Largest response body sent.
    #[must_use]
    pub const fn max_send_message_size(&self) -> Option<usize> {
        self.max_send_message_size
    }

    /// Encoding used for responses, if any.
    #[must_use]
    pub fn response_compression_algorithm(&self) -> Option<&str> {
        self.response_compression_algorithm.as_deref()
    }

    /// Level used for response compression.
    #[must_use]
    pub const fn response_compression_level(&self) -> Option<CompressionLevel> {
        self.response_compression_level
    }
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            compression_providers: compression::default_providers(),
            enable_detailed_errors: false,
            interceptors: Vec::new(),
            max_receive_message_size: Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE),
            max_send_message_size: None,
            response_compression_algorithm: None,
            response_compression_level: None,
        }
    }
}

impl fmt::Debug for MethodOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodOptions")
            .field("interceptors", &self.interceptors.len())
            .field("enable_detailed_errors", &self.enable_detailed_errors)
            .field("max_receive_message_size", &self.max_receive_message_size)
            .field("max_send_message_size", &self.max_send_message_size)
            .field(
                "response_compression_algorithm",
                &self.response_compression_algorithm,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::Interceptor;

    struct Noop;

    impl Interceptor for Noop {}

    #[test]
    fn test_defaults() {
        let options = MethodOptions::create([&ServiceOptions::new()]).unwrap();

        assert_eq!(
            options.max_receive_message_size(),
            Some(DEFAULT_MAX_RECEIVE_MESSAGE_SIZE)
        );
        assert_eq!(options.max_send_message_size(), None);
        assert!(!options.enable_detailed_errors());
        assert!(!options.has_interceptors());
        assert_eq!(options.compression_providers().len(), 1);
    }

    #[test]
    fn test_service_layer_overrides_global() {
        let global = ServiceOptions::new()
            .with_detailed_errors(true)
            .with_max_send_message_size(Some(10));
        let service = ServiceOptions::new()
            .with_detailed_errors(false)
            .with_max_receive_message_size(None);

        let options = MethodOptions::create([&global, &service]).unwrap();

        assert!(!options.enable_detailed_errors());
        assert_eq!(options.max_send_message_size(), Some(10));
        assert_eq!(options.max_receive_message_size(), None);
    }

    #[test]
    fn test_interceptors_accumulate_global_first() {
        let global = ServiceOptions::new()
            .with_interceptor(InterceptorRegistration::new(|| Ok(Noop)));
        let service = ServiceOptions::new()
            .with_interceptor(InterceptorRegistration::shared(Arc::new(Noop)));

        let options = MethodOptions::create([&global, &service]).unwrap();

        assert_eq!(options.interceptors().len(), 2);
        assert!(Arc::ptr_eq(&options.interceptors()[0], &global.interceptors[0]));
    }

    #[test]
    fn test_unknown_compression_algorithm_is_rejected() {
        let global = ServiceOptions::new().with_response_compression("br", None);

        assert!(matches!(
            MethodOptions::create([&global]),
            Err(Error::UnknownCompressionAlgorithm(name)) if name == "br"
        ));
    }
}
