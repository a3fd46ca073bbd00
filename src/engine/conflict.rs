use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn require<T>(value: Option<T>, name: &'static str) -> Result<T, EngineError> {
    value.ok_or(EngineError::MissingParameter(name))
}

/// Blank text counts as absent.
pub(crate) fn require_text<'a>(
    value: Option<&'a str>,
    name: &'static str,
) -> Result<&'a str, EngineError> {
    match value.map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(EngineError::MissingParameter(name)),
    }
}

pub fn parse_day(raw: Option<&str>) -> Result<Day, EngineError> {
    require_text(raw, "day")?
        .parse()
        .map_err(|e: ParseValueError| EngineError::InvalidParameter(e.to_string()))
}

/// A slot that can be booked: parses, and starts before it ends.
pub fn parse_booking_slot(raw: Option<&str>) -> Result<TimeSlot, EngineError> {
    let slot: TimeSlot = require_text(raw, "time_slot")?
        .parse()
        .map_err(|e: ParseValueError| EngineError::InvalidParameter(e.to_string()))?;
    if !slot.is_well_formed() {
        return Err(EngineError::InvalidParameter(format!(
            "time slot {slot} must start before it ends"
        )));
    }
    Ok(slot)
}

/// Turn a draft into a complete entry, reporting the first absent field in
/// declaration order.
pub(crate) fn entry_from_draft(id: Ulid, draft: &EntryDraft) -> Result<TimetableEntry, EngineError> {
    let course_id = require(draft.course_id, "course_id")?;
    let subject_id = require(draft.subject_id, "subject_id")?;
    let classroom_id = require(draft.classroom_id, "classroom_id")?;
    let day = parse_day(draft.day.as_deref())?;
    let slot = parse_booking_slot(draft.time_slot.as_deref())?;
    Ok(TimetableEntry {
        id,
        course_id,
        subject_id,
        classroom_id,
        day,
        slot,
    })
}

pub(crate) fn slot_conflict(entry: &TimetableEntry, existing: Ulid) -> EngineError {
    EngineError::SlotAlreadyBooked {
        classroom_id: entry.classroom_id,
        day: entry.day,
        slot: entry.slot,
        existing,
    }
}

/// Pre-check under the classroom write lock. `ignore` is the entry being
/// updated, which may keep its own slot.
pub(crate) fn check_slot_free(
    cs: &ClassroomState,
    day: Day,
    slot: &TimeSlot,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match cs.booking_at(day, slot) {
        Some(existing) if Some(existing.id) != ignore => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::SlotAlreadyBooked {
                classroom_id: cs.id,
                day,
                slot: *slot,
                existing: existing.id,
            })
        }
        _ => Ok(()),
    }
}
