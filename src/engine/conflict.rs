use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::busy::BusyIntervalProvider;
use crate::limits::*;
use crate::model::*;

use super::availability::HostCalendar;
use super::hours;
use super::locks::LockSet;
use super::EngineError;

const TOKEN_BYTES: usize = 24;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Opaque, unguessable booking token (URL-safe base64, no padding).
pub(super) fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `[now + notice, now + max_schedule_days)`.
pub(super) fn eligible_window(template: &MeetingTemplate, now: Ms) -> Option<Span> {
    Span::try_new(
        now + minutes(template.min_notice_minutes),
        now + Ms::from(template.max_schedule_days) * DAY,
    )
}

/// Bounds, notice period, and scheduling window for a requested interval.
pub(super) fn validate_time(template: &MeetingTemplate, span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidBookingTime("timestamp out of range"));
    }
    let Some(window) = eligible_window(template, now) else {
        return Err(EngineError::InvalidBookingTime("template has no bookable window"));
    };
    if span.start < window.start {
        return Err(EngineError::InvalidBookingTime("inside the minimum notice period"));
    }
    if span.end > window.end {
        return Err(EngineError::InvalidBookingTime("beyond the scheduling window"));
    }
    Ok(())
}

/// One host's working hours and busy time around `window`.
///
/// Busy time is gathered over `window` grown by the buffers, since a booking
/// just outside the window can still block a slot inside it. The flag reports
/// whether any calendar data was stale.
pub(super) fn host_calendar(
    hs: &HostState,
    busy: &dyn BusyIntervalProvider,
    overrides: Option<&AvailabilityRules>,
    window: &Span,
    buffers: Buffers,
    exclude: Option<Ulid>,
) -> (HostCalendar, bool) {
    let reach = window.expand(buffers.pre_ms(), buffers.post_ms());

    let working = hours::expand(&hs.tz, &hs.working_hours, overrides, window);
    let booked = hs
        .overlapping(&reach)
        .filter(|c| Some(c.booking_id) != exclude)
        .map(|c| c.blocked)
        .collect();

    let mut stale = false;
    let mut calendar_busy = Vec::new();
    for conn in &hs.connections {
        let result = busy.busy_intervals(conn, &reach);
        stale |= result.stale;
        calendar_busy.extend(result.spans);
    }

    let calendar = HostCalendar {
        working,
        calendar_busy,
        booked,
    };
    (calendar, stale)
}

/// Re-run the free-time computation for exactly `span` on every host in
/// `hosts` against the locked state. `exclude` skips the booking being moved.
pub(super) fn check_free(
    locks: &LockSet,
    hosts: &[Ulid],
    busy: &dyn BusyIntervalProvider,
    template: &MeetingTemplate,
    span: &Span,
    buffers: Buffers,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for host_id in hosts {
        let hs = locks
            .get(host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(*host_id))?;
        if hs.commitments.len() >= MAX_BOOKINGS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many bookings on host"));
        }
        let (calendar, stale) = host_calendar(
            hs,
            busy,
            template.availability_rules.as_ref(),
            span,
            buffers,
            exclude,
        );
        if stale {
            warn!(host = %host_id, "conflict check used stale calendar data");
        }
        if !calendar.free(buffers).iter().any(|f| f.contains_span(span)) {
            debug!(host = %host_id, start = span.start, end = span.end, "slot no longer free");
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotNotAvailable);
        }
    }
    Ok(())
}
