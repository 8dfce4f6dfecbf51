/// Options for declaring a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,

    /// Survive a broker restart.
    pub durable: bool,

    /// Only one consumer may attach.
    pub exclusive: bool,

    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
}

impl QueueOptions {
    /// Options for a queue with a fixed name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Options for a private reply queue with a broker generated name.
    #[must_use]
    pub fn server_named() -> Self {
        Self {
            auto_delete: true,
            durable: false,
            exclusive: true,
            name: String::new(),
        }
    }

    /// Sets whether the queue is auto deleted.
    #[must_use]
    pub const fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Sets whether the queue is durable.
    #[must_use]
    pub const fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the queue is exclusive.
    #[must_use]
    pub const fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }
}

/// Options for consuming from a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Settle deliveries as soon as they are handed out.
    pub auto_ack: bool,

    /// Refuse other consumers on the same queue.
    pub exclusive: bool,

    /// Maximum number of unsettled deliveries. `None` means unbounded.
    pub prefetch: Option<u16>,
}

impl ConsumeOptions {
    /// Sets auto acknowledgement.
    #[must_use]
    pub const fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Sets exclusive consumption.
    #[must_use]
    pub const fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Sets the prefetch window.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}
