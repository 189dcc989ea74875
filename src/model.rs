use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The engine's only authoritative time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

pub fn minutes(m: u32) -> Ms {
    Ms::from(m) * MINUTE
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` when the bounds do not describe a non-empty interval.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Grow the interval by `before` on the left and `after` on the right.
    pub fn expand(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }
}

// ── Settings records ─────────────────────────────────────────────

/// Padding around a booking during which the host stays busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffers {
    pub pre_minutes: u32,
    pub post_minutes: u32,
}

impl Buffers {
    pub fn pre_ms(&self) -> Ms {
        minutes(self.pre_minutes)
    }

    pub fn post_ms(&self) -> Ms {
        minutes(self.post_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: Ulid,
    pub name: Option<String>,
    /// IANA zone name, validated on write.
    pub timezone: String,
    pub default_buffers: Buffers,
}

/// Weekly recurring availability in the host's local time.
/// Weekday 0 = Monday … 6 = Sunday; minutes are counted from local midnight,
/// so `end_minute` may be 1440 to mean "until midnight".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHoursRule {
    pub weekday: u8,
    pub start_minute: u16,
    pub end_minute: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Unknown,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "unknown",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarConnection {
    pub id: Ulid,
    pub host_id: Ulid,
    pub provider: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<Ms>,
}

/// A local wall-clock window inside one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalWindow {
    pub start_minute: u16,
    pub end_minute: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayOverride {
    Closed,
    Windows(Vec<LocalWindow>),
}

/// Template-level narrowing of the host's working hours, keyed by weekday.
/// Days without an entry keep the host's base hours.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRules {
    pub days: BTreeMap<u8, DayOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHost {
    pub host_id: Ulid,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingTemplate {
    pub id: Ulid,
    /// Primary (owning) host.
    pub host_id: Ulid,
    pub name: Option<String>,
    /// Allowed durations in minutes; non-empty, the first is the default.
    pub durations: Vec<u32>,
    pub min_notice_minutes: u32,
    pub max_schedule_days: u32,
    /// `None` inherits the host's default buffer.
    pub pre_buffer_minutes: Option<u32>,
    pub post_buffer_minutes: Option<u32>,
    pub requires_approval: bool,
    pub active: bool,
    pub private: bool,
    pub availability_rules: Option<AvailabilityRules>,
    pub pooled: Vec<TemplateHost>,
}

/// Granularity of the candidate grid: the default duration or 15 minutes, whichever is smaller.
const MAX_SLOT_STEP_MINUTES: u32 = 15;

impl MeetingTemplate {
    pub fn default_duration(&self) -> u32 {
        self.durations.first().copied().unwrap_or(MAX_SLOT_STEP_MINUTES)
    }

    pub fn allows_duration(&self, minutes: u32) -> bool {
        self.durations.contains(&minutes)
    }

    /// Requested duration if allowed, otherwise the default.
    pub fn resolve_duration(&self, requested: u32) -> u32 {
        if self.allows_duration(requested) {
            requested
        } else {
            self.default_duration()
        }
    }

    pub fn slot_step_ms(&self) -> Ms {
        minutes(self.default_duration().min(MAX_SLOT_STEP_MINUTES))
    }

    pub fn buffers(&self, host_default: Buffers) -> Buffers {
        Buffers {
            pre_minutes: self.pre_buffer_minutes.unwrap_or(host_default.pre_minutes),
            post_minutes: self.post_buffer_minutes.unwrap_or(host_default.post_minutes),
        }
    }

    /// Hosts that must all be free: the primary plus required pooled hosts, sorted.
    pub fn required_hosts(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = std::iter::once(self.host_id)
            .chain(self.pooled.iter().filter(|p| !p.optional).map(|p| p.host_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_bookable(&self) -> bool {
        self.active && !self.private
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    /// Live bookings occupy their hosts' time.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "rejected" => Some(BookingStatus::Rejected),
            _ => None,
        }
    }
}

/// Who performed a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Host(Ulid),
    Invitee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitee {
    pub name: String,
    pub email: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub token: String,
    pub template_id: Ulid,
    pub host_id: Ulid,
    /// Primary plus required pooled hosts whose time this booking occupies.
    pub participants: Vec<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    pub buffers: Buffers,
    pub status: BookingStatus,
    pub archived: bool,
    pub invitee: Invitee,
    pub answers: Vec<Answer>,
    pub cancelled_by: Option<Actor>,
    pub cancel_reason: Option<String>,
    pub reject_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// The interval this booking keeps its hosts busy for, buffers included.
    pub fn blocked_span(&self) -> Span {
        self.span().expand(self.buffers.pre_ms(), self.buffers.post_ms())
    }
}

/// A candidate slot. `start`/`end` are authoritative; the local fields are presentation only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: Ms,
    pub end: Ms,
    pub local_start: DateTime<FixedOffset>,
    pub local_end: DateTime<FixedOffset>,
}

// ── Operation inputs and results ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub host_id: Ulid,
    pub template_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    /// Requester's IANA zone; falls back to the host's zone when absent or unknown.
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBookingInput {
    pub template_id: Ulid,
    pub host_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub invitee: Invitee,
    pub answers: Vec<Answer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleBookingInput {
    pub token: String,
    pub new_start: Ms,
    pub new_duration_minutes: u32,
}

/// A booking with its host and template, for confirmation display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking: Booking,
    pub host: Host,
    pub template: MeetingTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub connection_id: Ulid,
    pub host_id: Ulid,
    pub provider: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<Ms>,
    pub stale: bool,
}

/// Result of an external calendar sync, reported by the sync subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { at: Ms },
    Failed { at: Ms },
}

// ── Per-host state ───────────────────────────────────────────────

/// Busy time a live booking holds on one participant host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub booking_id: Ulid,
    /// Buffer-expanded span.
    pub blocked: Span,
}

#[derive(Debug, Clone)]
pub struct HostState {
    pub host: Host,
    pub tz: Tz,
    pub working_hours: Vec<WorkingHoursRule>,
    pub connections: Vec<CalendarConnection>,
    /// Sorted by `blocked.start`.
    pub commitments: Vec<Commitment>,
    /// Bookings for which this host is the primary host.
    pub bookings: HashMap<Ulid, Booking>,
}

impl HostState {
    pub fn new(host: Host, tz: Tz) -> Self {
        Self {
            host,
            tz,
            working_hours: Vec::new(),
            connections: Vec::new(),
            commitments: Vec::new(),
            bookings: HashMap::new(),
        }
    }

    /// Insert a commitment maintaining sort order by blocked start.
    pub fn insert_commitment(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.blocked.start, |c| c.blocked.start)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    pub fn remove_commitment(&mut self, booking_id: Ulid) -> Option<Commitment> {
        let pos = self.commitments.iter().position(|c| c.booking_id == booking_id)?;
        Some(self.commitments.remove(pos))
    }

    /// Commitments whose blocked span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.blocked.start < query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.blocked.end > query.start)
    }

    pub fn connection_mut(&mut self, id: Ulid) -> Option<&mut CalendarConnection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }
}

/// WAL record. Flat; booking events after creation are addressed by booking id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HostUpserted {
        host: Host,
    },
    WorkingHoursAdded {
        host_id: Ulid,
        rules: Vec<WorkingHoursRule>,
    },
    WorkingHoursCleared {
        host_id: Ulid,
    },
    ConnectionUpserted {
        connection: CalendarConnection,
    },
    SyncRecorded {
        connection_id: Ulid,
        host_id: Ulid,
        status: SyncStatus,
        at: Ms,
    },
    TemplateUpserted {
        template: MeetingTemplate,
    },
    TemplateHostAdded {
        template_id: Ulid,
        host: TemplateHost,
    },
    TemplateHostRemoved {
        template_id: Ulid,
        host_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingApproved {
        id: Ulid,
        at: Ms,
    },
    BookingRejected {
        id: Ulid,
        reason: String,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        by: Actor,
        reason: Option<String>,
        at: Ms,
    },
    BookingRescheduled {
        id: Ulid,
        start: Ms,
        duration_minutes: u32,
        participants: Vec<Ulid>,
        buffers: Buffers,
        at: Ms,
    },
    BookingArchived {
        id: Ulid,
        at: Ms,
    },
    BookingsArchived {
        host_id: Ulid,
        ids: Vec<Ulid>,
        at: Ms,
    },
    BookingUnarchived {
        id: Ulid,
        at: Ms,
    },
}
