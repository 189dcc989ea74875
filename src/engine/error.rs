use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested interval is no longer free at commit time.
    #[error("slot not available")]
    SlotNotAvailable,
    #[error("invalid booking time: {0}")]
    InvalidBookingTime(&'static str),
    #[error("booking is cancelled")]
    BookingCancelled,
    #[error("booking is already {}", .0.as_str())]
    BookingAlreadyTerminal(BookingStatus),
    #[error("template {0} is inactive or private")]
    TemplateInactiveOrPrivate(Ulid),
    #[error("host or template not found: {0}")]
    HostOrTemplateNotFound(Ulid),
    #[error("booking not found")]
    BookingNotFound,
    #[error("not permitted: {0}")]
    NotPermitted(&'static str),
    #[error("invalid transition: cannot {action} a {} booking", .status.as_str())]
    InvalidTransition {
        action: &'static str,
        status: BookingStatus,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
