use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{shared_free_time, slice_slots};
use super::conflict::{eligible_window, host_calendar};
use super::hours;
use super::{Engine, EngineError};

fn connection_health(conn: &CalendarConnection, now: Ms, stale_after: Ms) -> ConnectionHealth {
    let stale = match conn.sync_status {
        SyncStatus::Synced => conn.last_synced_at.is_none_or(|at| now - at > stale_after),
        SyncStatus::Unknown | SyncStatus::Failed => true,
    };
    ConnectionHealth {
        connection_id: conn.id,
        host_id: conn.host_id,
        provider: conn.provider.clone(),
        sync_status: conn.sync_status,
        last_synced_at: conn.last_synced_at,
        stale,
    }
}

impl Engine {
    /// Offerable slots for a template, ascending by start.
    ///
    /// Never fails for "no slots": an empty window, a disallowed duration, or
    /// a host with no working hours all give an empty or fallback result.
    /// Stale calendar data is still applied.
    pub async fn compute_slots(&self, query: &SlotQuery, now: Ms) -> Result<Vec<TimeSlot>, EngineError> {
        let template = self.bookable_template(&query.template_id, &query.host_id)?;
        let clamp = |t: Ms| t.clamp(MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS);
        let Some(requested) = Span::try_new(clamp(query.start), clamp(query.end)) else {
            return Ok(Vec::new());
        };
        if requested.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let duration = template.resolve_duration(query.duration_minutes);
        let Some(window) = eligible_window(&template, now).and_then(|w| w.intersect(&requested)) else {
            return Ok(Vec::new());
        };

        let primary = self
            .get_host(&template.host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(template.host_id))?;
        let (host_tz, host_defaults) = {
            let guard = primary.read().await;
            (guard.tz, guard.host.default_buffers)
        };
        let buffers = template.buffers(host_defaults);

        // One host at a time: reads need no consistent cross-host snapshot,
        // the commit path re-checks.
        let required = template.required_hosts();
        let mut calendars = Vec::with_capacity(required.len());
        for host_id in required {
            let hs = self
                .get_host(&host_id)
                .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
            let guard = hs.read().await;
            let (calendar, stale) = host_calendar(
                &guard,
                self.busy.as_ref(),
                template.availability_rules.as_ref(),
                &window,
                buffers,
                None,
            );
            if stale {
                metrics::counter!(crate::observability::STALE_CALENDAR_READS_TOTAL).increment(1);
                debug!(host = %host_id, "slot computation used stale calendar data");
            }
            calendars.push(calendar);
        }

        let free = shared_free_time(&calendars, buffers, &window);
        let spans = slice_slots(&free, minutes(duration), template.slot_step_ms());

        let tz = query
            .timezone
            .as_deref()
            .and_then(|name| hours::parse_timezone(name).ok())
            .unwrap_or(host_tz);
        Ok(spans
            .into_iter()
            .filter_map(|s| {
                Some(TimeSlot {
                    start: s.start,
                    end: s.end,
                    local_start: hours::local_time(&tz, s.start)?,
                    local_end: hours::local_time(&tz, s.end)?,
                })
            })
            .collect())
    }

    /// Host that owns a calendar connection.
    pub fn connection_owner(&self, connection_id: &Ulid) -> Option<Ulid> {
        self.connection_host.get(connection_id).map(|e| *e.value())
    }

    /// Invitee self-service lookup.
    pub async fn booking_by_token(&self, token: &str) -> Result<BookingReceipt, EngineError> {
        let (id, host_id) = self.resolve_token(token)?;
        let hs = self.get_host(&host_id).ok_or(EngineError::BookingNotFound)?;
        let guard = hs.read().await;
        let booking = guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or(EngineError::BookingNotFound)?;
        let template = self
            .get_template(&booking.template_id)
            .ok_or(EngineError::HostOrTemplateNotFound(booking.template_id))?;
        Ok(BookingReceipt {
            booking,
            host: guard.host.clone(),
            template: (*template).clone(),
        })
    }

    /// Bookings where `host_id` is the primary host, ordered by start.
    /// `archived` filters on visibility; `None` returns both.
    pub async fn bookings_for_host(&self, host_id: Ulid, archived: Option<bool>) -> Result<Vec<Booking>, EngineError> {
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
        let guard = hs.read().await;
        let mut bookings: Vec<Booking> = guard
            .bookings
            .values()
            .filter(|b| archived.is_none_or(|a| b.archived == a))
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.start, b.id));
        Ok(bookings)
    }

    pub async fn sync_health(
        &self,
        host_id: Ulid,
        now: Ms,
        stale_after: Ms,
    ) -> Result<Vec<ConnectionHealth>, EngineError> {
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
        let guard = hs.read().await;
        Ok(guard
            .connections
            .iter()
            .map(|c| connection_health(c, now, stale_after))
            .collect())
    }

    /// Stale connections across all hosts.
    pub async fn stale_connections(&self, now: Ms, stale_after: Ms) -> Vec<ConnectionHealth> {
        let hosts: Vec<_> = self.hosts.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for hs in hosts {
            let guard = hs.read().await;
            stale.extend(
                guard
                    .connections
                    .iter()
                    .map(|c| connection_health(c, now, stale_after))
                    .filter(|h| h.stale),
            );
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(status: SyncStatus, last: Option<Ms>) -> CalendarConnection {
        CalendarConnection {
            id: Ulid::new(),
            host_id: Ulid::new(),
            provider: "caldav".into(),
            sync_status: status,
            last_synced_at: last,
        }
    }

    #[test]
    fn health_by_status_and_age() {
        let now = 10 * HOUR;
        assert!(!connection_health(&connection(SyncStatus::Synced, Some(now - MINUTE)), now, HOUR).stale);
        assert!(connection_health(&connection(SyncStatus::Synced, Some(now - 2 * HOUR)), now, HOUR).stale);
        assert!(connection_health(&connection(SyncStatus::Synced, None), now, HOUR).stale);
        assert!(connection_health(&connection(SyncStatus::Failed, Some(now)), now, HOUR).stale);
        assert!(connection_health(&connection(SyncStatus::Unknown, None), now, HOUR).stale);
    }
}
