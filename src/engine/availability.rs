use crate::model::*;

use super::conflict::{parse_day, require_text};
use super::{Engine, EngineError};

// ── Availability ─────────────────────────────────────────────────

/// Classrooms with nothing booked at exactly (day, slot).
///
/// Only the exact pair counts: a room booked 09:00 - 10:00 is still free for
/// 09:30 - 10:30. Sorted by name, then id.
pub fn free_classrooms<'a>(
    rooms: impl IntoIterator<Item = &'a ClassroomState>,
    day: Day,
    slot: &TimeSlot,
) -> Vec<ClassroomInfo> {
    let mut free: Vec<ClassroomInfo> = rooms
        .into_iter()
        .filter(|cs| cs.is_free(day, slot))
        .map(ClassroomState::info)
        .collect();
    sort_classrooms(&mut free);
    free
}

pub(crate) fn sort_classrooms(rooms: &mut [ClassroomInfo]) {
    rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
}

impl Engine {
    pub async fn available_classrooms(
        &self,
        day: Option<&str>,
        time_slot: Option<&str>,
    ) -> Result<Vec<ClassroomInfo>, EngineError> {
        let day = parse_day(day)?;
        let raw_slot = require_text(time_slot, "time_slot")?;

        // Read locks taken in id order, then held together: the answer is one
        // consistent cut across rooms.
        let mut guards = Vec::new();
        for (_, rs) in self.classroom_handles() {
            guards.push(rs.read_owned().await);
        }

        // Nothing is ever booked at a slot that does not parse.
        let Ok(slot) = raw_slot.parse::<TimeSlot>() else {
            let mut all: Vec<ClassroomInfo> = guards.iter().map(|g| g.info()).collect();
            sort_classrooms(&mut all);
            return Ok(all);
        };

        Ok(free_classrooms(guards.iter().map(|g| &**g), day, &slot))
    }
}
