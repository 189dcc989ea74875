use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::BookingChange;

use super::conflict::{check_free, generate_token, validate_time};
use super::hours;
use super::lifecycle;
use super::locks::LockSet;
use super::{Engine, EngineError, WalCommand};

/// A booking transaction runs at most twice: once, and once more if the
/// template's required hosts changed between planning and locking.
const MAX_TRANSACTION_ATTEMPTS: usize = 2;

// ── Input validation ─────────────────────────────────────

fn validate_buffers(pre: u32, post: u32) -> Result<(), EngineError> {
    if pre > MAX_BUFFER_MINUTES || post > MAX_BUFFER_MINUTES {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    Ok(())
}

fn validate_host(host: &Host) -> Result<(), EngineError> {
    hours::parse_timezone(&host.timezone)?;
    if let Some(ref n) = host.name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("host name too long"));
    }
    validate_buffers(host.default_buffers.pre_minutes, host.default_buffers.post_minutes)
}

fn validate_template(t: &MeetingTemplate) -> Result<(), EngineError> {
    if t.durations.is_empty() {
        return Err(EngineError::InvalidInput("template needs at least one duration".into()));
    }
    if t.durations.len() > MAX_DURATIONS_PER_TEMPLATE {
        return Err(EngineError::LimitExceeded("too many durations"));
    }
    if let Some(d) = t.durations.iter().find(|d| **d == 0 || **d > MAX_DURATION_MINUTES) {
        return Err(EngineError::InvalidInput(format!("duration {d} out of range")));
    }
    if t.min_notice_minutes > MAX_NOTICE_MINUTES {
        return Err(EngineError::LimitExceeded("minimum notice too long"));
    }
    if t.max_schedule_days > MAX_SCHEDULE_DAYS {
        return Err(EngineError::LimitExceeded("scheduling window too long"));
    }
    validate_buffers(
        t.pre_buffer_minutes.unwrap_or(0),
        t.post_buffer_minutes.unwrap_or(0),
    )?;
    if let Some(ref n) = t.name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("template name too long"));
    }
    if t.pooled.len() > MAX_POOLED_HOSTS {
        return Err(EngineError::LimitExceeded("too many pooled hosts"));
    }
    if let Some(ref rules) = t.availability_rules {
        for (weekday, day) in &rules.days {
            if *weekday > 6 {
                return Err(EngineError::InvalidInput(format!("weekday {weekday} out of range 0-6")));
            }
            if let DayOverride::Windows(windows) = day
                && windows
                    .iter()
                    .any(|w| w.start_minute >= w.end_minute || w.end_minute > hours::MINUTES_PER_DAY)
            {
                return Err(EngineError::InvalidInput("invalid availability window".into()));
            }
        }
    }
    Ok(())
}

fn validate_invitee(invitee: &Invitee, answers: &[Answer]) -> Result<(), EngineError> {
    if invitee.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("invitee name is required".into()));
    }
    if invitee.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("invitee name too long"));
    }
    if invitee.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("invitee email too long"));
    }
    if !invitee.email.contains('@') {
        return Err(EngineError::InvalidInput(format!("invalid email: {:?}", invitee.email)));
    }
    if let Some(ref tz) = invitee.timezone {
        hours::parse_timezone(tz)?;
    }
    if answers.len() > MAX_ANSWERS {
        return Err(EngineError::LimitExceeded("too many answers"));
    }
    if answers
        .iter()
        .any(|a| a.question.len() > MAX_ANSWER_LEN || a.response.len() > MAX_ANSWER_LEN)
    {
        return Err(EngineError::LimitExceeded("answer too long"));
    }
    Ok(())
}

fn validate_reason(reason: &str) -> Result<(), EngineError> {
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

impl Engine {
    // ── Settings ingest ──────────────────────────────────

    pub async fn upsert_host(&self, host: Host) -> Result<(), EngineError> {
        validate_host(&host)?;
        let _settings = self.settings.lock().await;
        let event = Event::HostUpserted { host: host.clone() };
        match self.get_host(&host.id) {
            Some(hs) => {
                let mut guard = hs.write().await;
                self.persist_and_apply(&mut guard, &event).await
            }
            None => {
                self.wal_append(&event).await?;
                self.insert_host(host);
                Ok(())
            }
        }
    }

    pub async fn add_working_hours(&self, host_id: Ulid, rules: Vec<WorkingHoursRule>) -> Result<(), EngineError> {
        for rule in &rules {
            hours::validate_rule(rule)?;
        }
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
        let mut guard = hs.write().await;
        if guard.working_hours.len() + rules.len() > MAX_RULES_PER_HOST {
            return Err(EngineError::LimitExceeded("too many working-hours rules"));
        }
        let event = Event::WorkingHoursAdded { host_id, rules };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn clear_working_hours(&self, host_id: Ulid) -> Result<(), EngineError> {
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
        let mut guard = hs.write().await;
        let event = Event::WorkingHoursCleared { host_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Create or replace a template. An existing template keeps its pooled
    /// hosts; those change only through `add_template_host`/`remove_template_host`.
    pub async fn upsert_template(&self, mut template: MeetingTemplate) -> Result<(), EngineError> {
        validate_template(&template)?;
        let _settings = self.settings.lock().await;
        if self.get_host(&template.host_id).is_none() {
            return Err(EngineError::HostOrTemplateNotFound(template.host_id));
        }
        match self.get_template(&template.id) {
            Some(existing) => {
                if existing.host_id != template.host_id {
                    return Err(EngineError::InvalidInput("template belongs to another host".into()));
                }
                template.pooled = existing.pooled.clone();
            }
            None => {
                if let Some(p) = template.pooled.iter().find(|p| self.get_host(&p.host_id).is_none()) {
                    return Err(EngineError::HostOrTemplateNotFound(p.host_id));
                }
            }
        }
        let event = Event::TemplateUpserted {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        self.templates.insert(template.id, std::sync::Arc::new(template));
        Ok(())
    }

    pub async fn add_template_host(&self, template_id: Ulid, host: TemplateHost) -> Result<(), EngineError> {
        let _settings = self.settings.lock().await;
        let template = self
            .get_template(&template_id)
            .ok_or(EngineError::HostOrTemplateNotFound(template_id))?;
        if self.get_host(&host.host_id).is_none() {
            return Err(EngineError::HostOrTemplateNotFound(host.host_id));
        }
        if host.host_id == template.host_id {
            return Err(EngineError::InvalidInput("the primary host is always required".into()));
        }
        let replacing = template.pooled.iter().any(|p| p.host_id == host.host_id);
        if !replacing && template.pooled.len() >= MAX_POOLED_HOSTS {
            return Err(EngineError::LimitExceeded("too many pooled hosts"));
        }
        self.write_template_event(&template, Event::TemplateHostAdded { template_id, host })
            .await
    }

    pub async fn remove_template_host(&self, template_id: Ulid, host_id: Ulid) -> Result<(), EngineError> {
        let _settings = self.settings.lock().await;
        let template = self
            .get_template(&template_id)
            .ok_or(EngineError::HostOrTemplateNotFound(template_id))?;
        if !template.pooled.iter().any(|p| p.host_id == host_id) {
            return Err(EngineError::HostOrTemplateNotFound(host_id));
        }
        self.write_template_event(&template, Event::TemplateHostRemoved { template_id, host_id })
            .await
    }

    /// Caller holds the settings lock.
    async fn write_template_event(&self, template: &MeetingTemplate, event: Event) -> Result<(), EngineError> {
        let Some(next) = super::apply_to_template(template, &event) else {
            return Ok(());
        };
        self.wal_append(&event).await?;
        self.templates.insert(next.id, std::sync::Arc::new(next));
        Ok(())
    }

    /// Register or update a calendar connection. Sync status is preserved for
    /// an existing connection; it only changes through `record_sync`.
    pub async fn upsert_connection(&self, mut connection: CalendarConnection) -> Result<(), EngineError> {
        if connection.provider.is_empty() || connection.provider.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidInput("invalid calendar provider".into()));
        }
        if let Some(owner) = self.connection_host.get(&connection.id).map(|e| *e.value())
            && owner != connection.host_id
        {
            return Err(EngineError::InvalidInput("connection belongs to another host".into()));
        }
        let hs = self
            .get_host(&connection.host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(connection.host_id))?;
        let mut guard = hs.write().await;
        match guard.connections.iter().find(|c| c.id == connection.id) {
            Some(existing) => {
                connection.sync_status = existing.sync_status;
                connection.last_synced_at = existing.last_synced_at;
            }
            None if guard.connections.len() >= MAX_CONNECTIONS_PER_HOST => {
                return Err(EngineError::LimitExceeded("too many calendar connections"));
            }
            None => {}
        }
        let (id, host_id) = (connection.id, connection.host_id);
        let event = Event::ConnectionUpserted { connection };
        self.persist_and_apply(&mut guard, &event).await?;
        self.connection_host.insert(id, host_id);
        Ok(())
    }

    /// Bookkeeping for one sync run. The busy spans themselves go to the sync cache.
    pub async fn record_sync(&self, connection_id: Ulid, outcome: SyncOutcome) -> Result<(), EngineError> {
        let host_id = self
            .connection_host
            .get(&connection_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown calendar connection {connection_id}")))?;
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::HostOrTemplateNotFound(host_id))?;
        let (status, at) = match outcome {
            SyncOutcome::Synced { at } => (SyncStatus::Synced, at),
            SyncOutcome::Failed { at } => {
                warn!(connection = %connection_id, host = %host_id, "calendar sync failed, serving last snapshot");
                (SyncStatus::Failed, at)
            }
        };
        let mut guard = hs.write().await;
        let event = Event::SyncRecorded {
            connection_id,
            host_id,
            status,
            at,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Booking transactions ─────────────────────────────

    /// Template for a booking against `host_id`, checked for ownership and visibility.
    pub(super) fn bookable_template(
        &self,
        template_id: &Ulid,
        host_id: &Ulid,
    ) -> Result<std::sync::Arc<MeetingTemplate>, EngineError> {
        let template = self
            .get_template(template_id)
            .ok_or(EngineError::HostOrTemplateNotFound(*template_id))?;
        if self.get_host(host_id).is_none() {
            return Err(EngineError::HostOrTemplateNotFound(*host_id));
        }
        if template.host_id != *host_id {
            return Err(EngineError::HostOrTemplateNotFound(*template_id));
        }
        if !template.is_bookable() {
            return Err(EngineError::TemplateInactiveOrPrivate(*template_id));
        }
        Ok(template)
    }

    fn unique_token(&self) -> String {
        loop {
            let token = generate_token();
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }

    fn receipt(
        &self,
        locks: &LockSet,
        booking: Booking,
        template: &MeetingTemplate,
    ) -> Result<BookingReceipt, EngineError> {
        let host = locks
            .get(&booking.host_id)
            .map(|hs| hs.host.clone())
            .ok_or(EngineError::HostOrTemplateNotFound(booking.host_id))?;
        Ok(BookingReceipt {
            booking,
            host,
            template: template.clone(),
        })
    }

    fn requested_span(template: &MeetingTemplate, start: Ms, duration_minutes: u32) -> Result<Span, EngineError> {
        if !template.allows_duration(duration_minutes) {
            return Err(EngineError::InvalidBookingTime("duration not allowed"));
        }
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
            return Err(EngineError::InvalidBookingTime("timestamp out of range"));
        }
        Span::try_new(start, start + minutes(duration_minutes))
            .ok_or(EngineError::InvalidBookingTime("empty interval"))
    }

    fn note_retry(&self, operation: &'static str) {
        metrics::counter!(crate::observability::TRANSACTION_RETRIES_TOTAL, "operation" => operation).increment(1);
        debug!(operation, "required hosts changed while locking, retrying");
    }

    /// Reserve a slot. Re-checks the interval against the committed state of
    /// every required host while holding their write locks.
    pub async fn create_booking(&self, input: CreateBookingInput, now: Ms) -> Result<BookingReceipt, EngineError> {
        validate_invitee(&input.invitee, &input.answers)?;
        let template = self.bookable_template(&input.template_id, &input.host_id)?;
        let span = Self::requested_span(&template, input.start, input.duration_minutes)?;
        validate_time(&template, &span, now)?;

        let mut required = template.required_hosts();
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let mut locks = LockSet::acquire(self, required.iter().copied()).await?;

            let current = self.bookable_template(&input.template_id, &input.host_id)?;
            let current_required = current.required_hosts();
            if current_required != required {
                drop(locks);
                self.note_retry("create");
                required = current_required;
                continue;
            }
            let span = Self::requested_span(&current, input.start, input.duration_minutes)?;
            validate_time(&current, &span, now)?;

            let host_defaults = locks
                .get(&current.host_id)
                .map(|hs| hs.host.default_buffers)
                .unwrap_or_default();
            let buffers = current.buffers(host_defaults);
            check_free(&locks, &required, self.busy.as_ref(), &current, &span, buffers, None)?;

            let booking = Booking {
                id: Ulid::new(),
                token: self.unique_token(),
                template_id: current.id,
                host_id: current.host_id,
                participants: required.clone(),
                start: span.start,
                end: span.end,
                duration_minutes: input.duration_minutes,
                buffers,
                status: lifecycle::initial_status(&current),
                archived: false,
                invitee: input.invitee.clone(),
                answers: input.answers.clone(),
                cancelled_by: None,
                cancel_reason: None,
                reject_reason: None,
                created_at: now,
                updated_at: now,
            };
            let event = Event::BookingCreated {
                booking: booking.clone(),
            };
            self.commit_booking(&mut locks, event, &[(None, booking.clone())])
                .await?;
            self.publish(&locks, BookingChange::Created, &booking, None);
            return self.receipt(&locks, booking, &current);
        }
        Err(EngineError::SlotNotAvailable)
    }

    /// Move a live booking. Validated like a new booking, with the booking's
    /// own busy time excluded; on failure the original time is untouched.
    pub async fn reschedule_booking(
        &self,
        input: RescheduleBookingInput,
        actor: Actor,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        let (id, host_id) = self.resolve_token(&input.token)?;
        let snapshot = self
            .read_booking(&host_id, &id)
            .await
            .ok_or(EngineError::BookingNotFound)?;
        lifecycle::check_reschedule(&snapshot, actor)?;
        let template = self.bookable_template(&snapshot.template_id, &snapshot.host_id)?;
        let span = Self::requested_span(&template, input.new_start, input.new_duration_minutes)?;
        validate_time(&template, &span, now)?;

        let mut required = template.required_hosts();
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let (mut locks, prior) = self.lock_booking(&input.token, &required).await?;
            lifecycle::check_reschedule(&prior, actor)?;

            let current = self.bookable_template(&prior.template_id, &prior.host_id)?;
            let current_required = current.required_hosts();
            if current_required != required {
                drop(locks);
                self.note_retry("reschedule");
                required = current_required;
                continue;
            }
            let span = Self::requested_span(&current, input.new_start, input.new_duration_minutes)?;
            validate_time(&current, &span, now)?;

            let host_defaults = locks
                .get(&current.host_id)
                .map(|hs| hs.host.default_buffers)
                .unwrap_or_default();
            let buffers = current.buffers(host_defaults);
            check_free(&locks, &required, self.busy.as_ref(), &current, &span, buffers, Some(prior.id))?;

            let event = Event::BookingRescheduled {
                id: prior.id,
                start: span.start,
                duration_minutes: input.new_duration_minutes,
                participants: required.clone(),
                buffers,
                at: now,
            };
            let next = lifecycle::apply(&prior, &event).ok_or(EngineError::BookingNotFound)?;
            let previous_start = prior.start;
            self.commit_booking(&mut locks, event, &[(Some(prior), next.clone())])
                .await?;
            self.publish(&locks, BookingChange::Rescheduled, &next, Some(previous_start));
            return self.receipt(&locks, next, &current);
        }
        Err(EngineError::SlotNotAvailable)
    }

    /// Guarded single-booking transition that never moves the booking in time.
    async fn transition(
        &self,
        token: &str,
        check: impl FnOnce(&Booking) -> Result<(), EngineError>,
        make_event: impl FnOnce(&Booking) -> Event,
        change: Option<BookingChange>,
    ) -> Result<BookingReceipt, EngineError> {
        let (mut locks, prior) = self.lock_booking(token, &[]).await?;
        check(&prior)?;
        let event = make_event(&prior);
        let next = lifecycle::apply(&prior, &event).ok_or(EngineError::BookingNotFound)?;
        self.commit_booking(&mut locks, event, &[(Some(prior), next.clone())])
            .await?;
        match change {
            Some(change) => self.publish(&locks, change, &next, None),
            None => info!(booking = %next.id, archived = next.archived, "booking visibility changed"),
        }
        let template = self
            .get_template(&next.template_id)
            .ok_or(EngineError::HostOrTemplateNotFound(next.template_id))?;
        self.receipt(&locks, next, &template)
    }

    pub async fn approve_booking(&self, token: &str, actor: Actor, now: Ms) -> Result<BookingReceipt, EngineError> {
        self.transition(
            token,
            |b| lifecycle::check_approve(b, actor),
            |b| Event::BookingApproved { id: b.id, at: now },
            Some(BookingChange::Approved),
        )
        .await
    }

    pub async fn reject_booking(
        &self,
        token: &str,
        actor: Actor,
        reason: String,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        validate_reason(&reason)?;
        self.transition(
            token,
            |b| lifecycle::check_reject(b, actor),
            |b| Event::BookingRejected { id: b.id, reason, at: now },
            Some(BookingChange::Rejected),
        )
        .await
    }

    pub async fn cancel_booking(
        &self,
        token: &str,
        actor: Actor,
        reason: Option<String>,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        if let Some(ref r) = reason {
            validate_reason(r)?;
        }
        self.transition(
            token,
            |b| lifecycle::check_cancel(b, actor),
            |b| Event::BookingCancelled {
                id: b.id,
                by: actor,
                reason,
                at: now,
            },
            Some(BookingChange::Cancelled),
        )
        .await
    }

    pub async fn archive_booking(&self, token: &str, actor: Actor, now: Ms) -> Result<BookingReceipt, EngineError> {
        self.transition(
            token,
            |b| lifecycle::check_archive(b, actor),
            |b| Event::BookingArchived { id: b.id, at: now },
            None,
        )
        .await
    }

    pub async fn unarchive_booking(&self, token: &str, actor: Actor, now: Ms) -> Result<BookingReceipt, EngineError> {
        self.transition(
            token,
            |b| lifecycle::check_unarchive(b, actor),
            |b| Event::BookingUnarchived { id: b.id, at: now },
            None,
        )
        .await
    }

    /// Archive every cancelled or rejected booking of a host in one event.
    /// Returns how many were archived.
    pub async fn archive_all(&self, host_id: Ulid, actor: Actor, now: Ms) -> Result<usize, EngineError> {
        if actor != Actor::Host(host_id) {
            return Err(EngineError::NotPermitted("only the host can archive its bookings"));
        }
        let mut locks = LockSet::acquire(self, [host_id]).await?;
        let mut archivable: Vec<Booking> = locks
            .get(&host_id)
            .map(|hs| {
                hs.bookings
                    .values()
                    .filter(|b| lifecycle::is_archivable(b))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if archivable.is_empty() {
            return Ok(0);
        }
        archivable.sort_by_key(|b| (b.start, b.id));
        archivable.truncate(MAX_BULK_ARCHIVE);

        let event = Event::BookingsArchived {
            host_id,
            ids: archivable.iter().map(|b| b.id).collect(),
            at: now,
        };
        let changes: Vec<(Option<Booking>, Booking)> = archivable
            .into_iter()
            .filter_map(|prior| {
                let next = lifecycle::apply(&prior, &event)?;
                Some((Some(prior), next))
            })
            .collect();
        let count = changes.len();
        self.commit_booking(&mut locks, event, &changes).await?;
        info!(host = %host_id, count, "bookings archived");
        Ok(count)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Every host is read-locked for the duration, so no booking transaction
    /// can commit between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _settings = self.settings.lock().await;

        let mut ids: Vec<Ulid> = self.hosts.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(hs) = self.get_host(id) {
                guards.push(hs.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for hs in &guards {
            events.push(Event::HostUpserted { host: hs.host.clone() });
            if !hs.working_hours.is_empty() {
                events.push(Event::WorkingHoursAdded {
                    host_id: hs.host.id,
                    rules: hs.working_hours.clone(),
                });
            }
            for connection in &hs.connections {
                events.push(Event::ConnectionUpserted {
                    connection: connection.clone(),
                });
            }
        }
        for entry in self.templates.iter() {
            events.push(Event::TemplateUpserted {
                template: (**entry.value()).clone(),
            });
        }
        for hs in &guards {
            let mut bookings: Vec<&Booking> = hs.bookings.values().collect();
            bookings.sort_by_key(|b| (b.created_at, b.id));
            events.extend(bookings.into_iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
