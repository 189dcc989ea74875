mod availability;
mod conflict;
mod error;
pub mod hours;
mod lifecycle;
mod locks;
mod mutations;
mod queries;

pub use availability::{
    HostCalendar, dilate, intersect_all, merge_overlapping, normalize, shared_free_time, slice_slots,
    subtract_intervals,
};
pub use conflict::now_ms;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::busy::BusyIntervalProvider;
use crate::model::*;
use crate::notify::{BookingChange, BookingNotice, NotifyHub};
use crate::wal::Wal;

use locks::LockSet;

pub type SharedHostState = Arc<RwLock<HostState>>;

/// Attempts at locking a booking's hosts before giving up on a moving target.
const MAX_LOCK_ATTEMPTS: usize = 3;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            // Flush what we have before compacting or reporting.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    hosts: DashMap<Ulid, SharedHostState>,
    templates: DashMap<Ulid, Arc<MeetingTemplate>>,
    /// Public token → booking id.
    tokens: DashMap<String, Ulid>,
    /// Booking id → primary host id.
    booking_host: DashMap<Ulid, Ulid>,
    /// Calendar connection id → host id.
    connection_host: DashMap<Ulid, Ulid>,
    /// Serializes template writes, host creation, and compaction snapshots.
    settings: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    busy: Arc<dyn BusyIntervalProvider>,
}

/// Apply a host-scoped settings event. Caller holds the host's write lock.
fn apply_to_host(hs: &mut HostState, event: &Event) {
    match event {
        Event::HostUpserted { host } => {
            hs.tz = hours::parse_timezone(&host.timezone).unwrap_or(hs.tz);
            hs.host = host.clone();
        }
        Event::WorkingHoursAdded { rules, .. } => hs.working_hours.extend_from_slice(rules),
        Event::WorkingHoursCleared { .. } => hs.working_hours.clear(),
        Event::ConnectionUpserted { connection } => match hs.connection_mut(connection.id) {
            Some(existing) => *existing = connection.clone(),
            None => hs.connections.push(connection.clone()),
        },
        Event::SyncRecorded {
            connection_id,
            status,
            at,
            ..
        } => {
            if let Some(conn) = hs.connection_mut(*connection_id) {
                conn.sync_status = *status;
                if *status == SyncStatus::Synced {
                    conn.last_synced_at = Some(*at);
                }
            }
        }
        _ => {}
    }
}

/// The template after a pooled-host event.
fn apply_to_template(template: &MeetingTemplate, event: &Event) -> Option<MeetingTemplate> {
    let mut next = template.clone();
    match event {
        Event::TemplateHostAdded { host, .. } => {
            next.pooled.retain(|p| p.host_id != host.host_id);
            next.pooled.push(*host);
        }
        Event::TemplateHostRemoved { host_id, .. } => next.pooled.retain(|p| p.host_id != *host_id),
        _ => return None,
    }
    Some(next)
}

/// Booking id addressed by a single-booking transition event.
fn transition_booking_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingApproved { id, .. }
        | Event::BookingRejected { id, .. }
        | Event::BookingCancelled { id, .. }
        | Event::BookingRescheduled { id, .. }
        | Event::BookingArchived { id, .. }
        | Event::BookingUnarchived { id, .. } => Some(*id),
        _ => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        busy: Arc<dyn BusyIntervalProvider>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            hosts: DashMap::new(),
            templates: DashMap::new(),
            tokens: DashMap::new(),
            booking_host: DashMap::new(),
            connection_host: DashMap::new(),
            settings: Mutex::new(()),
            wal_tx,
            notify,
            busy,
        };

        // The engine is the sole owner of every lock here, so try_read/try_write
        // always succeed. Blocking variants would panic inside a runtime.
        for event in &events {
            engine.replay(event);
        }
        info!(
            events = events.len(),
            hosts = engine.hosts.len(),
            bookings = engine.booking_host.len(),
            "state rebuilt from WAL"
        );

        Ok(engine)
    }

    fn replay(&self, event: &Event) {
        match event {
            Event::HostUpserted { host } => match self.get_host(&host.id) {
                Some(hs) => {
                    if let Ok(mut guard) = hs.try_write() {
                        apply_to_host(&mut guard, event);
                    }
                }
                None => self.insert_host(host.clone()),
            },
            Event::WorkingHoursAdded { host_id, .. }
            | Event::WorkingHoursCleared { host_id }
            | Event::SyncRecorded { host_id, .. } => self.replay_on_host(host_id, event),
            Event::ConnectionUpserted { connection } => {
                self.connection_host.insert(connection.id, connection.host_id);
                self.replay_on_host(&connection.host_id, event);
            }
            Event::TemplateUpserted { template } => {
                self.templates.insert(template.id, Arc::new(template.clone()));
            }
            Event::TemplateHostAdded { template_id, .. } | Event::TemplateHostRemoved { template_id, .. } => {
                if let Some(template) = self.get_template(template_id)
                    && let Some(next) = apply_to_template(&template, event)
                {
                    self.templates.insert(*template_id, Arc::new(next));
                }
            }
            Event::BookingCreated { booking } => {
                let ids = booking.participants.iter().copied().chain([booking.host_id]);
                if let Some(mut locks) = LockSet::try_acquire(self, ids) {
                    self.install(&mut locks, None, Some(booking));
                }
            }
            Event::BookingsArchived { host_id, ids, .. } => {
                let Some(mut locks) = LockSet::try_acquire(self, [*host_id]) else {
                    return;
                };
                for id in ids {
                    let prior = locks.get(host_id).and_then(|hs| hs.bookings.get(id)).cloned();
                    if let Some(prior) = prior
                        && let Some(next) = lifecycle::apply(&prior, event)
                    {
                        self.install(&mut locks, Some(&prior), Some(&next));
                    }
                }
            }
            other => {
                let Some(id) = transition_booking_id(other) else {
                    return;
                };
                let Some(host_id) = self.booking_host.get(&id).map(|e| *e.value()) else {
                    return;
                };
                let prior = self.get_host(&host_id).and_then(|hs| {
                    let guard = hs.try_read().ok()?;
                    guard.bookings.get(&id).cloned()
                });
                let Some(prior) = prior else { return };
                let Some(next) = lifecycle::apply(&prior, other) else {
                    return;
                };
                let ids = prior
                    .participants
                    .iter()
                    .chain(&next.participants)
                    .copied()
                    .chain([host_id]);
                if let Some(mut locks) = LockSet::try_acquire(self, ids) {
                    self.install(&mut locks, Some(&prior), Some(&next));
                }
            }
        }
    }

    fn replay_on_host(&self, host_id: &Ulid, event: &Event) {
        if let Some(hs) = self.get_host(host_id)
            && let Ok(mut guard) = hs.try_write()
        {
            apply_to_host(&mut guard, event);
        }
    }

    fn insert_host(&self, host: Host) {
        let tz = hours::parse_timezone(&host.timezone).unwrap_or(chrono_tz::UTC);
        let id = host.id;
        self.hosts.insert(id, Arc::new(RwLock::new(HostState::new(host, tz))));
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, for host-scoped settings. Caller holds the host lock.
    async fn persist_and_apply(&self, hs: &mut HostState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_host(hs, event);
        Ok(())
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    pub fn get_template(&self, id: &Ulid) -> Option<Arc<MeetingTemplate>> {
        self.templates.get(id).map(|e| e.value().clone())
    }

    /// Booking id and primary host for a public token.
    fn resolve_token(&self, token: &str) -> Result<(Ulid, Ulid), EngineError> {
        let id = self
            .tokens
            .get(token)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound)?;
        let host_id = self
            .booking_host
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::BookingNotFound)?;
        Ok((id, host_id))
    }

    async fn read_booking(&self, host_id: &Ulid, id: &Ulid) -> Option<Booking> {
        let hs = self.get_host(host_id)?;
        let guard = hs.read().await;
        guard.bookings.get(id).cloned()
    }

    /// Lock the booking behind `token` together with every host it occupies,
    /// plus `extra` hosts. Retries when a concurrent reschedule moved the
    /// booking to hosts outside the locked set.
    async fn lock_booking(
        &self,
        token: &str,
        extra: &[Ulid],
    ) -> Result<(LockSet, Booking), EngineError> {
        let (id, host_id) = self.resolve_token(token)?;
        let mut participants = self
            .read_booking(&host_id, &id)
            .await
            .ok_or(EngineError::BookingNotFound)?
            .participants;

        for _ in 0..MAX_LOCK_ATTEMPTS {
            let ids = participants
                .iter()
                .copied()
                .chain([host_id])
                .chain(extra.iter().copied());
            let locks = LockSet::acquire(self, ids).await?;
            let booking = locks
                .get(&host_id)
                .and_then(|hs| hs.bookings.get(&id))
                .cloned()
                .ok_or(EngineError::BookingNotFound)?;
            if locks.holds_all(&booking.participants) {
                return Ok((locks, booking));
            }
            participants = booking.participants;
        }
        Err(EngineError::SlotNotAvailable)
    }

    /// Move one booking from `prior` to `next` in every index: the primary
    /// host's booking table, each participant's commitments, and the token and
    /// host lookups. Caller holds write locks on all hosts involved.
    fn install(&self, locks: &mut LockSet, prior: Option<&Booking>, next: Option<&Booking>) {
        if let Some(b) = prior
            && b.status.is_active()
        {
            for pid in &b.participants {
                if let Some(hs) = locks.get_mut(pid) {
                    hs.remove_commitment(b.id);
                }
            }
        }
        if let Some(b) = next
            && b.status.is_active()
        {
            for pid in &b.participants {
                if let Some(hs) = locks.get_mut(pid) {
                    hs.insert_commitment(Commitment {
                        booking_id: b.id,
                        blocked: b.blocked_span(),
                    });
                }
            }
        }
        match (prior, next) {
            (_, Some(b)) => {
                if let Some(hs) = locks.get_mut(&b.host_id) {
                    hs.bookings.insert(b.id, b.clone());
                }
                self.tokens.insert(b.token.clone(), b.id);
                self.booking_host.insert(b.id, b.host_id);
            }
            (Some(b), None) => {
                if let Some(hs) = locks.get_mut(&b.host_id) {
                    hs.bookings.remove(&b.id);
                }
                self.tokens.remove(&b.token);
                self.booking_host.remove(&b.id);
            }
            (None, None) => {}
        }
    }

    /// The booking transaction's commit step.
    ///
    /// A WAL slot is reserved first, so a caller dropped before that point
    /// leaves nothing behind. The changes are then applied in memory and handed
    /// to the writer with no await in between, and the durable ack is awaited
    /// with all locks still held. A failed append reverts the changes.
    async fn commit_booking(
        &self,
        locks: &mut LockSet,
        event: Event,
        changes: &[(Option<Booking>, Booking)],
    ) -> Result<(), EngineError> {
        let permit = self
            .wal_tx
            .reserve()
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;

        for (prior, next) in changes {
            self.install(locks, prior.as_ref(), Some(next));
        }
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append { event, response: tx });

        let ack = match rx.await {
            Ok(result) => result.map_err(|e| EngineError::WalError(e.to_string())),
            Err(_) => Err(EngineError::WalError("WAL writer dropped response".into())),
        };
        if let Err(e) = ack {
            for (prior, next) in changes.iter().rev() {
                self.install(locks, Some(next), prior.as_ref());
            }
            return Err(e);
        }
        Ok(())
    }

    /// Tell the booking's hosts about a committed change.
    fn publish(
        &self,
        locks: &LockSet,
        change: BookingChange,
        booking: &Booking,
        previous_start: Option<Ms>,
    ) {
        metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "transition" => change.as_str())
            .increment(1);
        info!(
            booking = %booking.id,
            host = %booking.host_id,
            transition = change.as_str(),
            status = booking.status.as_str(),
            start = booking.start,
            "booking committed"
        );

        let (Some(hs), Some(template)) = (locks.get(&booking.host_id), self.get_template(&booking.template_id))
        else {
            return;
        };
        let notice = BookingNotice {
            change,
            booking: booking.clone(),
            host: hs.host.clone(),
            template,
            previous_start,
        };
        let mut audience = booking.participants.clone();
        audience.push(booking.host_id);
        audience.sort();
        audience.dedup();
        for host_id in audience {
            self.notify.send(host_id, &notice);
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}
