//! Serialization adapters.
//!
//! A [`Marshaller`] writes a value into a [`SerializationContext`] and reads
//! one back from a [`DeserializationContext`]. Marshallers either hand over a
//! finished payload with [`SerializationContext::complete`] or write into the
//! context's buffer and call [`SerializationContext::complete_buffer`].

use crate::error::{Error, Result};

use std::fmt::{Debug, Display};
use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

/// Converts typed messages to and from byte payloads.
pub trait Marshaller<T>: Debug + Send + Sync + 'static {
    /// Serializes `value` into `context`, completing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn serialize(&self, value: &T, context: &mut SerializationContext) -> Result<()>;

    /// Deserializes a value from `context`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not hold a valid `T`.
    fn deserialize(&self, context: &DeserializationContext) -> Result<T>;
}

/// Destination for a single serialized payload.
#[derive(Debug, Default)]
pub struct SerializationContext {
    buffer: Option<BytesMut>,
    payload: Option<Bytes>,
    payload_length: Option<usize>,
}

impl SerializationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hints the final payload length so the buffer can be sized up front.
    pub const fn set_payload_length(&mut self, length: usize) {
        self.payload_length = Some(length);
    }

    /// Buffer to write the payload into before calling
    /// [`complete_buffer`](Self::complete_buffer).
    pub fn buffer_writer(&mut self) -> &mut BytesMut {
        let capacity = self.payload_length.unwrap_or(0);
        self.buffer.get_or_insert_with(|| BytesMut::with_capacity(capacity))
    }

    /// Completes the context with a finished payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if called twice.
    pub fn complete(&mut self, payload: Bytes) -> Result<()> {
        if self.payload.is_some() {
            return Err(Error::AlreadyCompleted);
        }
        self.payload = Some(payload);
        Ok(())
    }

    /// Completes the context with whatever was written to the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyCompleted`] if called twice.
    pub fn complete_buffer(&mut self) -> Result<()> {
        let buffer = self.buffer.take().unwrap_or_default();
        self.complete(buffer.freeze())
    }

    /// Takes the completed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCompleted`] if the marshaller never completed.
    pub fn into_payload(self) -> Result<Bytes> {
        self.payload.ok_or(Error::NotCompleted)
    }
}

/// Source of a single payload to deserialize.
#[derive(Debug)]
pub struct DeserializationContext {
    payload: Bytes,
}

impl DeserializationContext {
    /// Wraps a payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Length of the payload.
    #[must_use]
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// The payload as a cheap clone.
    #[must_use]
    pub fn payload_as_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// The payload as a slice.
    #[must_use]
    pub fn payload_as_slice(&self) -> &[u8] {
        &self.payload
    }
}

/// Runs a marshaller end to end.
///
/// # Errors
///
/// Returns an error if serialization fails or the marshaller does not complete.
pub fn serialize<T: 'static>(marshaller: &dyn Marshaller<T>, value: &T) -> Result<Bytes> {
    let mut context = SerializationContext::new();
    marshaller.serialize(value, &mut context)?;
    context.into_payload()
}

/// Runs a marshaller over a payload.
///
/// # Errors
///
/// Returns an error if the payload cannot be deserialized.
pub fn deserialize<T: 'static>(marshaller: &dyn Marshaller<T>, payload: Bytes) -> Result<T> {
    marshaller.deserialize(&DeserializationContext::new(payload))
}

/// CBOR marshaller for serde types.
pub struct CborMarshaller<T>(PhantomData<fn() -> T>);

/// JSON marshaller for serde types.
pub struct JsonMarshaller<T>(PhantomData<fn() -> T>);

/// Marshaller for types convertible to and from [`Bytes`].
pub struct BytesConvertMarshaller<T>(PhantomData<fn() -> T>);

macro_rules! phantom_marshaller {
    ($($name:ident),*) => {
        $(
            impl<T> $name<T> {
                /// Creates the marshaller.
                #[must_use]
                pub const fn new() -> Self {
                    Self(PhantomData)
                }
            }

            impl<T> Default for $name<T> {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl<T> Clone for $name<T> {
                fn clone(&self) -> Self {
                    Self::new()
                }
            }

            impl<T> Debug for $name<T> {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}<{}>", stringify!($name), std::any::type_name::<T>())
                }
            }
        )*
    };
}

phantom_marshaller!(CborMarshaller, JsonMarshaller, BytesConvertMarshaller);

impl<T> Marshaller<T> for CborMarshaller<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, value: &T, context: &mut SerializationContext) -> Result<()> {
        ciborium::ser::into_writer(value, context.buffer_writer().writer())
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;
        context.complete_buffer()
    }

    fn deserialize(&self, context: &DeserializationContext) -> Result<T> {
        ciborium::de::from_reader(context.payload_as_slice())
            .map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

impl<T> Marshaller<T> for JsonMarshaller<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, value: &T, context: &mut SerializationContext) -> Result<()> {
        let payload =
            serde_json::to_vec(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        context.set_payload_length(payload.len());
        context.complete(Bytes::from(payload))
    }

    fn deserialize(&self, context: &DeserializationContext) -> Result<T> {
        serde_json::from_slice(context.payload_as_slice())
            .map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

impl<T, E> Marshaller<T> for BytesConvertMarshaller<T>
where
    T: Clone + TryFrom<Bytes, Error = E> + TryInto<Bytes, Error = E> + 'static,
    E: Display,
{
    fn serialize(&self, value: &T, context: &mut SerializationContext) -> Result<()> {
        let payload: Bytes = value
            .clone()
            .try_into()
            .map_err(|e: E| Error::SerializationFailed(e.to_string()))?;
        context.complete(payload)
    }

    fn deserialize(&self, context: &DeserializationContext) -> Result<T> {
        T::try_from(context.payload_as_bytes())
            .map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

/// UTF-8 string marshaller.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringMarshaller;

impl Marshaller<String> for StringMarshaller {
    fn serialize(&self, value: &String, context: &mut SerializationContext) -> Result<()> {
        context.set_payload_length(value.len());
        context.buffer_writer().put_slice(value.as_bytes());
        context.complete_buffer()
    }

    fn deserialize(&self, context: &DeserializationContext) -> Result<String> {
        String::from_utf8(context.payload_as_slice().to_vec())
            .map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

/// Pass-through marshaller for raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesMarshaller;

impl Marshaller<Bytes> for BytesMarshaller {
    fn serialize(&self, value: &Bytes, context: &mut SerializationContext) -> Result<()> {
        context.complete(value.clone())
    }

    fn deserialize(&self, context: &DeserializationContext) -> Result<Bytes> {
        Ok(context.payload_as_bytes())
    }
}
