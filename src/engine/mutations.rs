use dashmap::mapref::entry::Entry;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_slot_free, entry_from_draft, parse_booking_slot, parse_day, require};
use super::{Engine, EngineError, SharedClassroomState, apply_move, apply_to_classroom};

/// An entry can be moved by a concurrent update between looking up its
/// classroom and locking it; retry the lookup this many times.
pub(super) const MAX_RELOCK_ATTEMPTS: usize = 8;

/// Write-lock two distinct classrooms in id order.
async fn lock_pair(
    (a_id, a): (Ulid, SharedClassroomState),
    (b_id, b): (Ulid, SharedClassroomState),
) -> (
    OwnedRwLockWriteGuard<ClassroomState>,
    OwnedRwLockWriteGuard<ClassroomState>,
) {
    if a_id < b_id {
        let ga = a.write_owned().await;
        let gb = b.write_owned().await;
        (ga, gb)
    } else {
        let gb = b.write_owned().await;
        let ga = a.write_owned().await;
        (ga, gb)
    }
}

impl Engine {
    fn ensure_course(&self, id: Ulid) -> Result<(), EngineError> {
        if self.courses.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id))
        }
    }

    /// Book a classroom. The classroom write lock serialises every writer of
    /// its (day, slot) keys; the booking index refuses duplicates regardless.
    pub async fn create_timetable_entry(
        &self,
        id: Ulid,
        draft: EntryDraft,
    ) -> Result<TimetableEntry, EngineError> {
        let entry = entry_from_draft(id, &draft)?;

        let _catalog = self.catalog_lock.read().await;
        self.ensure_course(entry.course_id)?;
        if !self.subjects.contains_key(&entry.subject_id) {
            return Err(EngineError::NotFound(entry.subject_id));
        }
        let rs = self
            .get_classroom(&entry.classroom_id)
            .ok_or(EngineError::NotFound(entry.classroom_id))?;

        let mut guard = rs.write().await;
        if guard.booking_count() >= MAX_ENTRIES_PER_CLASSROOM {
            return Err(EngineError::LimitExceeded("too many entries in classroom"));
        }
        if let Err(e) = check_slot_free(&guard, entry.day, &entry.slot, None) {
            debug!("booking refused: {e}");
            return Err(e);
        }
        // Entry ids are global but room locks are not: claim the id in the
        // reverse index before persisting so two rooms cannot both take it.
        match self.entry_to_classroom.entry(id) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(format!("timetable entry {id}")));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.classroom_id);
            }
        }

        let event = Event::EntryCreated {
            entry: entry.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.entry_to_classroom.remove(&id);
            return Err(e);
        }
        info!(
            "booked classroom {} on {} at {} (entry {id})",
            entry.classroom_id, entry.day, entry.slot
        );
        Ok(entry)
    }

    /// Change course, classroom, day and slot of an entry. The target triple
    /// goes through the same conflict check as a new booking; the entry's own
    /// current booking does not count against it.
    pub async fn update_timetable_entry(
        &self,
        id: Ulid,
        update: EntryUpdate,
    ) -> Result<TimetableEntry, EngineError> {
        let course_id = require(update.course_id, "course_id")?;
        let classroom_id = require(update.classroom_id, "classroom_id")?;
        let day = parse_day(update.day.as_deref())?;
        let slot = parse_booking_slot(update.time_slot.as_deref())?;

        let _catalog = self.catalog_lock.read().await;
        self.ensure_course(course_id)?;
        let target = self
            .get_classroom(&classroom_id)
            .ok_or(EngineError::NotFound(classroom_id))?;

        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let from_id = self
                .classroom_for_entry(&id)
                .ok_or(EngineError::NotFound(id))?;
            let source = self
                .get_classroom(&from_id)
                .ok_or(EngineError::NotFound(from_id))?;

            if from_id == classroom_id {
                let mut guard = source.write_owned().await;
                let Some(current) = guard.entry(id).cloned() else {
                    continue;
                };
                let updated = TimetableEntry {
                    course_id,
                    day,
                    slot,
                    ..current
                };
                check_slot_free(&guard, day, &slot, Some(id))?;
                let event = Event::EntryUpdated {
                    from_classroom_id: from_id,
                    entry: updated.clone(),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                info!("updated entry {id}: {day} {slot}");
                return Ok(updated);
            }

            let (mut from_guard, mut to_guard) =
                lock_pair((from_id, source), (classroom_id, target.clone())).await;
            let Some(current) = from_guard.entry(id).cloned() else {
                continue;
            };
            let updated = TimetableEntry {
                course_id,
                classroom_id,
                day,
                slot,
                ..current
            };
            if to_guard.booking_count() >= MAX_ENTRIES_PER_CLASSROOM {
                return Err(EngineError::LimitExceeded("too many entries in classroom"));
            }
            check_slot_free(&to_guard, day, &slot, Some(id))?;
            let event = Event::EntryUpdated {
                from_classroom_id: from_id,
                entry: updated.clone(),
            };
            self.wal_append(&event).await?;
            apply_move(
                &mut from_guard,
                &mut to_guard,
                &updated,
                &self.entry_to_classroom,
            )
            .map_err(|existing| super::conflict::slot_conflict(&updated, existing))?;
            info!("moved entry {id} from classroom {from_id} to {classroom_id}: {day} {slot}");
            return Ok(updated);
        }
        Err(EngineError::NotFound(id))
    }

    pub async fn delete_timetable_entry(&self, id: Ulid) -> Result<TimetableEntry, EngineError> {
        let (classroom_id, mut guard) = self.resolve_entry_write(&id).await?;
        let entry = guard.entry(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::EntryDeleted { id, classroom_id };
        self.wal_append(&event).await?;
        // Deletes cannot be refused by the booking index.
        let _ = apply_to_classroom(&mut guard, &event, &self.entry_to_classroom);
        info!("deleted entry {id} from classroom {classroom_id}");
        Ok(entry)
    }

    pub async fn get_timetable_entry(&self, id: Ulid) -> Option<TimetableEntry> {
        let classroom_id = self.classroom_for_entry(&id)?;
        let rs = self.get_classroom(&classroom_id)?;
        let guard = rs.read().await;
        guard.entry(id).cloned()
    }
}
