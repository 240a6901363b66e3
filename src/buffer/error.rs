//! Buffer engine errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("state store error: {0}")]
    State(#[source] std::io::Error),

    #[error("durable timer error: {0}")]
    Timer(#[source] std::io::Error),

    #[error("buffer actor for {0} is unavailable")]
    ActorUnavailable(String),
}
