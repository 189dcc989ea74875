//! Booking state machine.
//!
//! ```text
//! create ──► pending ──approve──► confirmed
//!    │          │                    │
//!    └──────────┼────────────────────┘ (no approval needed)
//!               ├──reject──► rejected ─┐
//!               └──cancel──► cancelled ┴─archive⇄unarchive
//! ```
//!
//! Guards check an action against the current booking without touching it;
//! [`apply`] turns an already-accepted event into the next booking value and is
//! shared by live commits and WAL replay.

use crate::model::*;

use super::EngineError;

pub fn initial_status(template: &MeetingTemplate) -> BookingStatus {
    if template.requires_approval {
        BookingStatus::Pending
    } else {
        BookingStatus::Confirmed
    }
}

fn require_primary_host(booking: &Booking, actor: Actor, action: &'static str) -> Result<(), EngineError> {
    match actor {
        Actor::Host(id) if id == booking.host_id => Ok(()),
        _ => Err(EngineError::NotPermitted(action)),
    }
}

fn require_host_or_invitee(booking: &Booking, actor: Actor, action: &'static str) -> Result<(), EngineError> {
    match actor {
        Actor::Invitee => Ok(()),
        Actor::Host(id) if id == booking.host_id => Ok(()),
        Actor::Host(_) => Err(EngineError::NotPermitted(action)),
    }
}

/// Error for acting on a cancelled or rejected booking.
fn terminal(status: BookingStatus) -> EngineError {
    match status {
        BookingStatus::Cancelled => EngineError::BookingCancelled,
        other => EngineError::BookingAlreadyTerminal(other),
    }
}

pub fn check_approve(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_primary_host(booking, actor, "only the host can approve a booking")?;
    match booking.status {
        BookingStatus::Pending => Ok(()),
        BookingStatus::Confirmed => Err(EngineError::InvalidTransition {
            action: "approve",
            status: booking.status,
        }),
        other => Err(terminal(other)),
    }
}

pub fn check_reject(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_primary_host(booking, actor, "only the host can reject a booking")?;
    match booking.status {
        BookingStatus::Pending => Ok(()),
        BookingStatus::Confirmed => Err(EngineError::InvalidTransition {
            action: "reject",
            status: booking.status,
        }),
        other => Err(terminal(other)),
    }
}

pub fn check_cancel(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_host_or_invitee(booking, actor, "only the host or the invitee can cancel a booking")?;
    if booking.status.is_active() {
        Ok(())
    } else {
        Err(terminal(booking.status))
    }
}

pub fn check_reschedule(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_host_or_invitee(booking, actor, "only the host or the invitee can reschedule a booking")?;
    if booking.status.is_active() {
        Ok(())
    } else {
        Err(terminal(booking.status))
    }
}

/// Archival is a visibility flag for finished bookings only.
pub fn is_archivable(booking: &Booking) -> bool {
    !booking.status.is_active() && !booking.archived
}

pub fn check_archive(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_primary_host(booking, actor, "only the host can archive a booking")?;
    if is_archivable(booking) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            action: "archive",
            status: booking.status,
        })
    }
}

pub fn check_unarchive(booking: &Booking, actor: Actor) -> Result<(), EngineError> {
    require_primary_host(booking, actor, "only the host can unarchive a booking")?;
    if booking.archived {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            action: "unarchive",
            status: booking.status,
        })
    }
}

/// The booking after `event`. `None` for events that do not address this booking.
pub fn apply(booking: &Booking, event: &Event) -> Option<Booking> {
    let mut next = booking.clone();
    match event {
        Event::BookingApproved { id, at } if *id == booking.id => {
            next.status = BookingStatus::Confirmed;
            next.updated_at = *at;
        }
        Event::BookingRejected { id, reason, at } if *id == booking.id => {
            next.status = BookingStatus::Rejected;
            next.reject_reason = Some(reason.clone());
            next.updated_at = *at;
        }
        Event::BookingCancelled { id, by, reason, at } if *id == booking.id => {
            next.status = BookingStatus::Cancelled;
            next.cancelled_by = Some(*by);
            next.cancel_reason = reason.clone();
            next.updated_at = *at;
        }
        Event::BookingRescheduled {
            id,
            start,
            duration_minutes,
            participants,
            buffers,
            at,
        } if *id == booking.id => {
            next.start = *start;
            next.end = *start + minutes(*duration_minutes);
            next.duration_minutes = *duration_minutes;
            next.participants = participants.clone();
            next.buffers = *buffers;
            next.updated_at = *at;
        }
        Event::BookingArchived { id, at } if *id == booking.id => {
            next.archived = true;
            next.updated_at = *at;
        }
        Event::BookingsArchived { ids, at, .. } if ids.contains(&booking.id) => {
            next.archived = true;
            next.updated_at = *at;
        }
        Event::BookingUnarchived { id, at } if *id == booking.id => {
            next.archived = false;
            next.updated_at = *at;
        }
        _ => return None,
    }
    Some(next)
}
