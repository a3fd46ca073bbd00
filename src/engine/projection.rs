use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::Engine;

/// Which entries a credential may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility<'a> {
    All,
    Courses(&'a BTreeSet<Ulid>),
    Nothing,
}

impl<'a> Visibility<'a> {
    pub fn of(credential: &'a Credential) -> Self {
        match credential {
            Credential::Admin { .. } => Visibility::All,
            Credential::Student { course_ids, .. } if course_ids.is_empty() => Visibility::Nothing,
            Credential::Student { course_ids, .. } => Visibility::Courses(course_ids),
        }
    }

    pub fn admits(&self, course_id: &Ulid) -> bool {
        match self {
            Visibility::All => true,
            Visibility::Courses(ids) => ids.contains(course_id),
            Visibility::Nothing => false,
        }
    }
}

/// Course name, subject name, day, slot. Id last so equal rows keep a stable order.
pub fn sort_projection(rows: &mut [ProjectedEntry]) {
    rows.sort_by(|a, b| {
        a.course_name
            .cmp(&b.course_name)
            .then_with(|| a.subject_name.cmp(&b.subject_name))
            .then_with(|| a.day.cmp(&b.day))
            .then_with(|| a.slot.cmp(&b.slot))
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl Engine {
    /// The timetable as the credential's holder may see it. Enrollment is
    /// never consulted: a student sees exactly the snapshot in the credential.
    pub async fn list_timetable(&self, credential: &Credential) -> Vec<ProjectedEntry> {
        let visibility = Visibility::of(credential);
        if visibility == Visibility::Nothing {
            return Vec::new();
        }

        let mut rows = Vec::new();
        for (_, rs) in self.classroom_handles() {
            let guard = rs.read().await;
            for entry in guard.entries() {
                if !visibility.admits(&entry.course_id) {
                    continue;
                }
                // Inner join: an entry whose course or subject is gone is not shown.
                let (Some(course), Some(subject)) = (
                    self.courses.get(&entry.course_id),
                    self.subjects.get(&entry.subject_id),
                ) else {
                    continue;
                };
                rows.push(ProjectedEntry {
                    id: entry.id,
                    course_id: entry.course_id,
                    course_name: course.name.clone(),
                    subject_name: subject.name.clone(),
                    room_name: guard.name.clone(),
                    day: entry.day,
                    slot: entry.slot,
                });
            }
        }
        sort_projection(&mut rows);
        rows
    }
}
