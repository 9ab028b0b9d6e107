use arbor_transport::TransportConfig;
use std::time::Duration;

/// Configuration for a [`Host`](crate::Host).
///
/// ```rust
/// use arbor_overlay::HostConfig;
///
/// let config = HostConfig::new()
///     .inbound_queue(4096)
///     .mailbox_capacity(64);
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Settings for the underlying secure transport.
    pub transport: TransportConfig,
    /// Capacity of the per-host queue between connection readers and the
    /// routing task. Readers wait when it is full.
    pub inbound_queue: usize,
    /// Capacity of every per-instance mailbox and handler queue. Messages
    /// arriving at a full mailbox are rejected.
    pub mailbox_capacity: usize,
    /// How many unknown trees may have messages parked at once. Messages
    /// naming a further unknown tree are dropped.
    pub pending_trees: usize,
    /// How long parked messages wait for their tree before they are
    /// dropped.
    pub park_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            transport: TransportConfig::new(),
            inbound_queue: 1024,
            mailbox_capacity: 256,
            pending_trees: 64,
            park_timeout: Duration::from_secs(30),
        }
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn inbound_queue(mut self, capacity: usize) -> Self {
        self.inbound_queue = capacity.max(1);
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    pub fn pending_trees(mut self, capacity: usize) -> Self {
        self.pending_trees = capacity.max(1);
        self
    }

    pub fn park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout;
        self
    }
}
