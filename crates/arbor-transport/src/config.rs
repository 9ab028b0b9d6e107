use std::time::Duration;

/// Largest payload a frame can describe: the length prefix is a `u32`
/// covering the 16-byte type id too.
pub(crate) const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize - 16;

/// Configuration shared by a [`SecureHost`](crate::SecureHost) and its
/// connections.
///
/// ```rust
/// use arbor_transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::new()
///     .max_message_size(4 * 1024 * 1024)
///     .handshake_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame accepted or sent, in bytes.
    pub(crate) max_message_size: usize,
    /// Upper bound for the authentication handshake.
    pub(crate) handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Defaults: 1 MiB frames, 5 s handshake.
    ///
    /// `ARBOR_MAX_MESSAGE_SIZE` overrides the frame size when it parses.
    pub fn new() -> Self {
        let max_message_size = std::env::var("ARBOR_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024 * 1024);

        Self {
            max_message_size: max_message_size.min(MAX_FRAME_PAYLOAD),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// Capped at what a frame's `u32` length prefix can carry.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes.min(MAX_FRAME_PAYLOAD);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn get_max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_size_fits_the_length_prefix() {
        let config = TransportConfig::new().max_message_size(usize::MAX);
        assert_eq!(config.get_max_message_size(), MAX_FRAME_PAYLOAD);
        assert!(config.get_max_message_size() + 16 <= u32::MAX as usize);

        let config = TransportConfig::new().max_message_size(4096);
        assert_eq!(config.get_max_message_size(), 4096);
    }
}
