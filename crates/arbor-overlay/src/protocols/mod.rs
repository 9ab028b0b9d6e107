//! Protocols every host can run.

pub mod close_all;
pub mod count;

pub use close_all::{CloseAllProtocol, CloseObserver};
pub use count::{count_with_retry, CountProtocol};
