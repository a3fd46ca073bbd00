mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod projection;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::free_classrooms;
pub use conflict::{parse_booking_slot, parse_day};
pub use error::EngineError;
pub use projection::{Visibility, sort_projection};

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedClassroomState = Arc<RwLock<ClassroomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// flushes and fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Compaction must see every append queued before it.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch is refused; nothing staged may reach disk.
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory timetable state, made durable by the WAL.
pub struct Engine {
    classrooms: DashMap<Ulid, SharedClassroomState>,
    courses: DashMap<Ulid, Course>,
    subjects: DashMap<Ulid, Subject>,
    users: DashMap<Ulid, User>,
    /// Lowercased email → user id.
    emails: DashMap<String, Ulid>,
    /// Subject code → subject id.
    subject_codes: DashMap<String, Ulid>,
    /// Student id → enrolled course ids.
    enrollments: DashMap<Ulid, BTreeSet<Ulid>>,
    /// Reverse lookup: timetable entry id → classroom id.
    entry_to_classroom: DashMap<Ulid, Ulid>,
    /// Taken shared by writers that rely on catalog references staying
    /// valid, exclusively by catalog changes.
    catalog_lock: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply an entry event to one classroom (caller holds the lock).
/// Refusal by the booking index returns the id of the entry holding the slot.
fn apply_to_classroom(
    cs: &mut ClassroomState,
    event: &Event,
    entry_map: &DashMap<Ulid, Ulid>,
) -> Result<(), Ulid> {
    match event {
        Event::EntryCreated { entry } => {
            cs.insert_booking(entry.clone())?;
            entry_map.insert(entry.id, cs.id);
        }
        Event::EntryUpdated { entry, .. } => {
            let previous = cs.remove_booking(entry.id);
            if let Err(existing) = cs.insert_booking(entry.clone()) {
                if let Some(prev) = previous {
                    let _ = cs.insert_booking(prev);
                }
                return Err(existing);
            }
            entry_map.insert(entry.id, cs.id);
        }
        Event::EntryDeleted { id, .. } => {
            cs.remove_booking(*id);
            entry_map.remove(id);
        }
        // Catalog events are handled at the DashMap level.
        _ => {}
    }
    Ok(())
}

/// Move an entry between classrooms (caller holds both locks).
fn apply_move(
    from: &mut ClassroomState,
    to: &mut ClassroomState,
    entry: &TimetableEntry,
    entry_map: &DashMap<Ulid, Ulid>,
) -> Result<(), Ulid> {
    let previous = from.remove_booking(entry.id);
    if let Err(existing) = to.insert_booking(entry.clone()) {
        if let Some(prev) = previous {
            let _ = from.insert_booking(prev);
        }
        return Err(existing);
    }
    entry_map.insert(entry.id, to.id);
    Ok(())
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open_with_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            classrooms: DashMap::new(),
            courses: DashMap::new(),
            subjects: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            subject_codes: DashMap::new(),
            enrollments: DashMap::new(),
            entry_to_classroom: DashMap::new(),
            catalog_lock: RwLock::new(()),
            wal_tx,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this runs inside the runtime.
        for event in &events {
            match event {
                Event::EntryUpdated {
                    from_classroom_id,
                    entry,
                } if *from_classroom_id != entry.classroom_id => {
                    let (Some(from), Some(to)) = (
                        engine.get_classroom(from_classroom_id),
                        engine.get_classroom(&entry.classroom_id),
                    ) else {
                        warn!("replay: entry {} moved between unknown classrooms", entry.id);
                        continue;
                    };
                    let mut from = from.try_write().expect("replay: uncontended write");
                    let mut to = to.try_write().expect("replay: uncontended write");
                    if let Err(existing) =
                        apply_move(&mut from, &mut to, entry, &engine.entry_to_classroom)
                    {
                        warn!("replay: entry {} refused, slot held by {existing}", entry.id);
                    }
                }
                Event::EntryCreated { entry } | Event::EntryUpdated { entry, .. } => {
                    engine.replay_into(entry.classroom_id, event);
                }
                Event::EntryDeleted { classroom_id, .. } => {
                    engine.replay_into(*classroom_id, event);
                }
                other => engine.apply_catalog(other),
            }
        }

        Ok(engine)
    }

    fn replay_into(&self, classroom_id: Ulid, event: &Event) {
        let Some(rs) = self.get_classroom(&classroom_id) else {
            warn!("replay: event for unknown classroom {classroom_id}");
            return;
        };
        let mut guard = rs.try_write().expect("replay: uncontended write");
        if let Err(existing) = apply_to_classroom(&mut guard, event, &self.entry_to_classroom) {
            warn!("replay: booking refused in classroom {classroom_id}, slot held by {existing}");
        }
    }

    /// Apply a catalog event to the DashMaps.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                name,
                email,
                role,
            } => {
                self.emails.insert(email.to_lowercase(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                    },
                );
            }
            Event::UserUpdated { id, name, email } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    self.emails.remove(&user.email.to_lowercase());
                    self.emails.insert(email.to_lowercase(), *id);
                    user.name = name.clone();
                    user.email = email.clone();
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.emails.remove(&user.email.to_lowercase());
                }
                self.enrollments.remove(id);
            }
            Event::CourseCreated { id, code, name } => {
                self.courses.insert(
                    *id,
                    Course {
                        id: *id,
                        code: code.clone(),
                        name: name.clone(),
                    },
                );
            }
            Event::CourseDeleted { id } => {
                let orphaned: Vec<(Ulid, String)> = self
                    .subjects
                    .iter()
                    .filter(|s| s.course_id == *id)
                    .map(|s| (s.id, s.code.clone()))
                    .collect();
                for (subject_id, code) in orphaned {
                    self.subjects.remove(&subject_id);
                    self.subject_codes.remove(&code);
                }
                for mut courses in self.enrollments.iter_mut() {
                    courses.remove(id);
                }
                self.courses.remove(id);
            }
            Event::SubjectCreated {
                id,
                code,
                name,
                course_id,
            } => {
                self.subject_codes.insert(code.clone(), *id);
                self.subjects.insert(
                    *id,
                    Subject {
                        id: *id,
                        code: code.clone(),
                        name: name.clone(),
                        course_id: *course_id,
                    },
                );
            }
            Event::SubjectDeleted { id } => {
                if let Some((_, subject)) = self.subjects.remove(id) {
                    self.subject_codes.remove(&subject.code);
                }
            }
            Event::ClassroomCreated { id, name, capacity } => {
                let cs = ClassroomState::new(*id, name.clone(), *capacity);
                self.classrooms.insert(*id, Arc::new(RwLock::new(cs)));
            }
            Event::Enrolled {
                student_id,
                course_id,
            } => {
                self.enrollments
                    .entry(*student_id)
                    .or_default()
                    .insert(*course_id);
            }
            Event::EnrollmentReplaced {
                student_id,
                course_ids,
            } => {
                if course_ids.is_empty() {
                    self.enrollments.remove(student_id);
                } else {
                    self.enrollments
                        .insert(*student_id, course_ids.iter().copied().collect());
                }
            }
            // Entry events are applied to classroom state under its lock.
            Event::EntryCreated { .. } | Event::EntryUpdated { .. } | Event::EntryDeleted { .. } => {}
        }
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
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    /// WAL-append, then apply to the classroom the caller has locked.
    async fn persist_and_apply(
        &self,
        cs: &mut ClassroomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_classroom(cs, event, &self.entry_to_classroom).map_err(|existing| {
            error!("booking index refused a pre-checked entry in classroom {}", cs.id);
            match event {
                Event::EntryCreated { entry } | Event::EntryUpdated { entry, .. } => {
                    conflict::slot_conflict(entry, existing)
                }
                _ => EngineError::StorageFailure("booking index refused event".into()),
            }
        })
    }

    /// WAL-append, then apply a catalog event.
    async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    pub fn get_classroom(&self, id: &Ulid) -> Option<SharedClassroomState> {
        self.classrooms.get(id).map(|e| e.value().clone())
    }

    pub fn classroom_for_entry(&self, entry_id: &Ulid) -> Option<Ulid> {
        self.entry_to_classroom.get(entry_id).map(|e| *e.value())
    }

    /// All classroom handles, ordered by id. Multi-lock paths take locks in
    /// this order.
    fn classroom_handles(&self) -> Vec<(Ulid, SharedClassroomState)> {
        let mut handles: Vec<_> = self
            .classrooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    /// Lookup entry → classroom, acquire the write lock, and confirm the entry
    /// is still there (a concurrent update may have moved it).
    async fn resolve_entry_write(
        &self,
        entry_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ClassroomState>), EngineError> {
        for _ in 0..mutations::MAX_RELOCK_ATTEMPTS {
            let classroom_id = self
                .classroom_for_entry(entry_id)
                .ok_or(EngineError::NotFound(*entry_id))?;
            let rs = self
                .get_classroom(&classroom_id)
                .ok_or(EngineError::NotFound(classroom_id))?;
            let guard = rs.write_owned().await;
            if guard.entry(*entry_id).is_some() {
                return Ok((classroom_id, guard));
            }
        }
        Err(EngineError::NotFound(*entry_id))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Writers are held off until the swap is done.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        let mut guards = Vec::new();
        for (_, rs) in self.classroom_handles() {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            name: u.name,
            email: u.email,
            role: u.role,
        }));

        let mut courses: Vec<Course> = self.courses.iter().map(|c| c.value().clone()).collect();
        courses.sort_by_key(|c| c.id);
        events.extend(courses.into_iter().map(|c| Event::CourseCreated {
            id: c.id,
            code: c.code,
            name: c.name,
        }));

        let mut subjects: Vec<Subject> = self.subjects.iter().map(|s| s.value().clone()).collect();
        subjects.sort_by_key(|s| s.id);
        events.extend(subjects.into_iter().map(|s| Event::SubjectCreated {
            id: s.id,
            code: s.code,
            name: s.name,
            course_id: s.course_id,
        }));

        for guard in &guards {
            events.push(Event::ClassroomCreated {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
            });
        }

        let mut enrollments: Vec<(Ulid, Vec<Ulid>)> = self
            .enrollments
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (*e.key(), e.value().iter().copied().collect()))
            .collect();
        enrollments.sort_by_key(|(student_id, _)| *student_id);
        events.extend(
            enrollments
                .into_iter()
                .map(|(student_id, course_ids)| Event::EnrollmentReplaced {
                    student_id,
                    course_ids,
                }),
        );

        for guard in &guards {
            for entry in guard.entries() {
                events.push(Event::EntryCreated {
                    entry: entry.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
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
