use thiserror::Error;

/// Error types for bus construction and subscription.
///
/// The publish path is deliberately infallible: a producer never observes a
/// consumer failure, and a lapped consumer is charged on its own `lost`
/// counter instead of failing the publish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Ring capacity was not a nonzero power of two.
    #[error("ring capacity must be a nonzero power of two, got {got}")]
    InvalidBufferSize {
        /// The rejected capacity.
        got: usize,
    },

    /// A consumer with the same name is already registered on this ring.
    #[error("consumer `{name}` is already subscribed")]
    DuplicateConsumer {
        /// The conflicting consumer name.
        name: String,
    },
}
