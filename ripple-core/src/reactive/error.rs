//! Error types for the reactive system.

use std::any::Any;

use thiserror::Error;

use super::subscriber::SourceId;

/// Errors surfaced by fallible reactive reads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// A computed value's derivation panicked.
    ///
    /// The previously cached value, if any, is left in place.
    #[error("derivation panicked: {message}")]
    Derivation { message: String },

    /// A computed value was read from inside its own derivation.
    #[error("cycle detected: computed {computed} was read during its own derivation")]
    Cycle { computed: SourceId },
}

/// Result alias for reactive operations.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Render a panic payload for logs and error messages.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
