use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight.
pub type Minutes = u16;

const MINUTES_PER_DAY: Minutes = 24 * 60;

/// A teaching day. Weekends are not schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
}

impl Day {
    pub const ALL: [Day; 5] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
            Day::Friday => "Friday",
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Day {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Day::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseValueError::new("day", s))
    }
}

/// A bounded interval within one day, e.g. `09:00 - 10:00`.
///
/// Ordered by start, then end. Bookings match on the exact pair, so two slots
/// that merely overlap do not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: Minutes,
    pub end: Minutes,
}

impl TimeSlot {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        Self { start, end }
    }

    /// Shorthand for whole-hour slots in tests and seed data.
    pub fn hours(start_hour: Minutes, end_hour: Minutes) -> Self {
        Self::new(start_hour * 60, end_hour * 60)
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end && self.end <= MINUTES_PER_DAY
    }

    pub fn duration_minutes(&self) -> Minutes {
        self.end.saturating_sub(self.start)
    }
}

impl Ord for TimeSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl PartialOrd for TimeSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02} - {:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

impl FromStr for TimeSlot {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseValueError::new("time slot", s);
        let (start, end) = s.split_once('-').ok_or_else(err)?;
        let start = parse_clock(start).ok_or_else(err)?;
        let end = parse_clock(end).ok_or_else(err)?;
        Ok(TimeSlot { start, end })
    }
}

/// `H:MM` / `HH:MM`, 00:00 through 24:00.
fn parse_clock(s: &str) -> Option<Minutes> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: Minutes = h.parse().ok()?;
    let m: Minutes = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "student" => Ok(Role::Student),
            _ => Err(ParseValueError::new("role", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseValueError {
    pub what: &'static str,
    pub input: String,
}

impl ParseValueError {
    fn new(what: &'static str, input: &str) -> Self {
        Self {
            what,
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.input)
    }
}

impl std::error::Error for ParseValueError {}

// ── Catalog records ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: Ulid,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: Ulid,
    pub code: String,
    pub name: String,
    pub course_id: Ulid,
}

/// One booked lesson: a course's subject in a classroom at a (day, slot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub id: Ulid,
    pub course_id: Ulid,
    pub subject_id: Ulid,
    pub classroom_id: Ulid,
    pub day: Day,
    pub slot: TimeSlot,
}

impl TimetableEntry {
    pub fn key(&self) -> (Day, TimeSlot) {
        (self.day, self.slot)
    }
}

/// A classroom together with everything booked in it.
#[derive(Debug, Clone)]
pub struct ClassroomState {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    /// Keyed by (day, slot). One entry per key: this map is the uniqueness
    /// constraint every booking path ends in.
    bookings: BTreeMap<(Day, TimeSlot), TimetableEntry>,
}

impl ClassroomState {
    pub fn new(id: Ulid, name: String, capacity: u32) -> Self {
        Self {
            id,
            name,
            capacity,
            bookings: BTreeMap::new(),
        }
    }

    pub fn booking_at(&self, day: Day, slot: &TimeSlot) -> Option<&TimetableEntry> {
        self.bookings.get(&(day, *slot))
    }

    pub fn is_free(&self, day: Day, slot: &TimeSlot) -> bool {
        !self.bookings.contains_key(&(day, *slot))
    }

    /// Insert a booking. Refuses an occupied (day, slot) and hands back the
    /// id of the entry already holding it.
    pub fn insert_booking(&mut self, entry: TimetableEntry) -> Result<(), Ulid> {
        use std::collections::btree_map::Entry;
        match self.bookings.entry(entry.key()) {
            Entry::Occupied(existing) => Err(existing.get().id),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove a booking by entry id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<TimetableEntry> {
        let key = self.bookings.values().find(|e| e.id == id)?.key();
        self.bookings.remove(&key)
    }

    pub fn entry(&self, id: Ulid) -> Option<&TimetableEntry> {
        self.bookings.values().find(|e| e.id == id)
    }

    /// Bookings in (day, slot) order.
    pub fn entries(&self) -> impl Iterator<Item = &TimetableEntry> {
        self.bookings.values()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn info(&self) -> ClassroomInfo {
        ClassroomInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }
}

// ── Access credential ────────────────────────────────────────────

/// What a session is allowed to see. Issued once per session; the student
/// course set is a snapshot and goes stale when enrollment changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Credential {
    Admin {
        user_id: Ulid,
    },
    Student {
        user_id: Ulid,
        course_ids: BTreeSet<Ulid>,
    },
}

impl Credential {
    pub fn user_id(&self) -> Ulid {
        match self {
            Credential::Admin { user_id } | Credential::Student { user_id, .. } => *user_id,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Credential::Admin { .. } => Role::Admin,
            Credential::Student { .. } => Role::Student,
        }
    }
}

// ── Write requests ───────────────────────────────────────────────

/// Proposed booking as received from a client. Every field is mandatory;
/// absence is reported, not defaulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryDraft {
    pub course_id: Option<Ulid>,
    pub subject_id: Option<Ulid>,
    pub classroom_id: Option<Ulid>,
    pub day: Option<String>,
    pub time_slot: Option<String>,
}

/// Fields an update may change. The subject stays as booked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryUpdate {
    pub course_id: Option<Ulid>,
    pub classroom_id: Option<Ulid>,
    pub day: Option<String>,
    pub time_slot: Option<String>,
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    UserUpdated {
        id: Ulid,
        name: String,
        email: String,
    },
    UserDeleted {
        id: Ulid,
    },
    CourseCreated {
        id: Ulid,
        code: String,
        name: String,
    },
    /// Removes the course and all of its subjects.
    CourseDeleted {
        id: Ulid,
    },
    SubjectCreated {
        id: Ulid,
        code: String,
        name: String,
        course_id: Ulid,
    },
    SubjectDeleted {
        id: Ulid,
    },
    ClassroomCreated {
        id: Ulid,
        name: String,
        capacity: u32,
    },
    Enrolled {
        student_id: Ulid,
        course_id: Ulid,
    },
    EnrollmentReplaced {
        student_id: Ulid,
        course_ids: Vec<Ulid>,
    },
    EntryCreated {
        entry: TimetableEntry,
    },
    EntryUpdated {
        from_classroom_id: Ulid,
        entry: TimetableEntry,
    },
    EntryDeleted {
        id: Ulid,
        classroom_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassroomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
}

/// A timetable entry joined with the names a reader wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedEntry {
    pub id: Ulid,
    pub course_id: Ulid,
    pub course_name: String,
    pub subject_name: String,
    pub room_name: String,
    pub day: Day,
    pub slot: TimeSlot,
}

/// One row per (student, enrolled course); a student with no courses gets a
/// single row with no course.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRow {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub course_id: Option<Ulid>,
    pub course_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseWithSubjects {
    pub course: Course,
    pub subjects: Vec<Subject>,
}
