use super::*;
use crate::limits::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("timetabled_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

const MON_9: &str = "09:00 - 10:00";
const MON_10: &str = "10:00 - 11:00";

/// Two rooms, two courses with one subject each.
struct Campus {
    r1: Ulid,
    r2: Ulid,
    maths: Ulid,
    calculus: Ulid,
    physics: Ulid,
    optics: Ulid,
}

async fn seed(engine: &Engine) -> Campus {
    let campus = Campus {
        r1: Ulid::new(),
        r2: Ulid::new(),
        maths: Ulid::new(),
        calculus: Ulid::new(),
        physics: Ulid::new(),
        optics: Ulid::new(),
    };
    engine.create_classroom(campus.r1, "R1".into(), 30).await.unwrap();
    engine.create_classroom(campus.r2, "R2".into(), 60).await.unwrap();
    engine
        .create_course(campus.maths, "MATH".into(), "Maths".into())
        .await
        .unwrap();
    engine
        .create_course(campus.physics, "PHYS".into(), "Physics".into())
        .await
        .unwrap();
    engine
        .create_subject(campus.calculus, "MATH101".into(), "Calculus".into(), campus.maths)
        .await
        .unwrap();
    engine
        .create_subject(campus.optics, "PHYS201".into(), "Optics".into(), campus.physics)
        .await
        .unwrap();
    campus
}

fn draft(course: Ulid, subject: Ulid, room: Ulid, day: &str, slot: &str) -> EntryDraft {
    EntryDraft {
        course_id: Some(course),
        subject_id: Some(subject),
        classroom_id: Some(room),
        day: Some(day.into()),
        time_slot: Some(slot.into()),
    }
}

fn update(course: Ulid, room: Ulid, day: &str, slot: &str) -> EntryUpdate {
    EntryUpdate {
        course_id: Some(course),
        classroom_id: Some(room),
        day: Some(day.into()),
        time_slot: Some(slot.into()),
    }
}

fn admin() -> Credential {
    Credential::Admin {
        user_id: Ulid::new(),
    }
}

/// Uniqueness check across the whole store.
async fn assert_unique_triples(engine: &Engine) {
    let mut seen = std::collections::HashSet::new();
    for (_, rs) in engine.classroom_handles() {
        let guard = rs.read().await;
        for e in guard.entries() {
            assert!(
                seen.insert((e.classroom_id, e.day, e.slot)),
                "duplicate triple {:?}",
                (e.classroom_id, e.day, e.slot)
            );
        }
    }
}

// ── Conflict guard ───────────────────────────────────────

#[tokio::test]
async fn booking_conflict_scenario() {
    let engine = Engine::new(test_wal_path("conflict_scenario.wal")).unwrap();
    let c = seed(&engine).await;

    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    // Same triple, different course and subject: refused.
    let clash = engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "Monday", MON_9))
        .await;
    match clash {
        Err(EngineError::SlotAlreadyBooked { classroom_id, day, slot, .. }) => {
            assert_eq!(classroom_id, c.r1);
            assert_eq!(day, Day::Monday);
            assert_eq!(slot, TimeSlot::hours(9, 10));
        }
        other => panic!("expected SlotAlreadyBooked, got {other:?}"),
    }
    assert_eq!(engine.entry_count(), 1);

    // Next hour is fine.
    engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "Monday", MON_10))
        .await
        .unwrap();
    assert_eq!(engine.entry_count(), 2);
}

#[tokio::test]
async fn rejected_booking_leaves_store_untouched() {
    let engine = Engine::new(test_wal_path("conflict_untouched.wal")).unwrap();
    let c = seed(&engine).await;
    let first = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Tuesday", MON_9))
        .await
        .unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let _ = engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "tuesday", "9:00-10:00"))
        .await
        .unwrap_err();

    assert_eq!(engine.get_timetable_entry(first.id).await, Some(first));
    assert_eq!(engine.entry_count(), 1);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn equivalent_slot_spellings_conflict() {
    let engine = Engine::new(test_wal_path("slot_spelling.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", "9:00 - 10:00"))
        .await
        .unwrap();
    let result = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "MONDAY", "09:00-10:00"))
        .await;
    assert!(matches!(result, Err(EngineError::SlotAlreadyBooked { .. })));
}

#[tokio::test]
async fn same_slot_other_room_or_day_succeeds() {
    let engine = Engine::new(test_wal_path("other_room_day.wal")).unwrap();
    let c = seed(&engine).await;
    for (room, day) in [(c.r1, "Monday"), (c.r2, "Monday"), (c.r1, "Friday")] {
        engine
            .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, room, day, MON_9))
            .await
            .unwrap();
    }
    assert_eq!(engine.entry_count(), 3);
    assert_unique_triples(&engine).await;
}

#[tokio::test]
async fn booking_missing_fields() {
    let engine = Engine::new(test_wal_path("booking_missing.wal")).unwrap();
    let c = seed(&engine).await;

    let mut d = draft(c.maths, c.calculus, c.r1, "Monday", MON_9);
    d.classroom_id = None;
    assert!(matches!(
        engine.create_timetable_entry(Ulid::new(), d).await,
        Err(EngineError::MissingParameter("classroom_id"))
    ));

    let mut d = draft(c.maths, c.calculus, c.r1, "Monday", MON_9);
    d.time_slot = Some(String::new());
    assert!(matches!(
        engine.create_timetable_entry(Ulid::new(), d).await,
        Err(EngineError::MissingParameter("time_slot"))
    ));

    assert_eq!(engine.entry_count(), 0);
}

#[tokio::test]
async fn booking_unknown_references() {
    let engine = Engine::new(test_wal_path("booking_refs.wal")).unwrap();
    let c = seed(&engine).await;
    let ghost = Ulid::new();

    for d in [
        draft(ghost, c.calculus, c.r1, "Monday", MON_9),
        draft(c.maths, ghost, c.r1, "Monday", MON_9),
        draft(c.maths, c.calculus, ghost, "Monday", MON_9),
    ] {
        let result = engine.create_timetable_entry(Ulid::new(), d).await;
        assert!(matches!(result, Err(EngineError::NotFound(id)) if id == ghost));
    }
    assert_eq!(engine.entry_count(), 0);
}

#[tokio::test]
async fn booking_duplicate_id_rejected() {
    let engine = Engine::new(test_wal_path("booking_dup_id.wal")).unwrap();
    let c = seed(&engine).await;
    let id = Ulid::new();
    engine
        .create_timetable_entry(id, draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();
    let result = engine
        .create_timetable_entry(id, draft(c.maths, c.calculus, c.r2, "Monday", MON_9))
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn booking_reversed_slot_rejected() {
    let engine = Engine::new(test_wal_path("booking_reversed.wal")).unwrap();
    let c = seed(&engine).await;
    let result = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", "10:00 - 09:00"))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidParameter(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_triple_exactly_one_wins() {
    let engine = Arc::new(Engine::new(test_wal_path("concurrent_triple.wal")).unwrap());
    let c = seed(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let eng = engine.clone();
        let d = draft(c.maths, c.calculus, c.r1, "Wednesday", MON_9);
        handles.push(tokio::spawn(async move {
            eng.create_timetable_entry(Ulid::new(), d).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::SlotAlreadyBooked { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 31);
    assert_eq!(engine.entry_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_moves_keep_triples_unique() {
    let engine = Arc::new(Engine::new(test_wal_path("concurrent_moves.wal")).unwrap());
    let c = seed(&engine).await;

    // Entries in R1, all trying to move to the same R2 triple.
    let mut ids = Vec::new();
    for slot in ["08:00 - 09:00", MON_9, MON_10, "11:00 - 12:00"] {
        let e = engine
            .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", slot))
            .await
            .unwrap();
        ids.push(e.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let eng = engine.clone();
        let u = update(c.maths, c.r2, "Thursday", "14:00 - 15:00");
        handles.push(tokio::spawn(async move { eng.update_timetable_entry(id, u).await }));
    }
    let wins = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(engine.entry_count(), 4);
    assert_unique_triples(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_entry_id_in_two_rooms_created_once() {
    let engine = Arc::new(Engine::new(test_wal_path("same_id_two_rooms.wal")).unwrap());
    let c = seed(&engine).await;

    for round in 0..50 {
        let id = Ulid::new();
        let (a, b) = (engine.clone(), engine.clone());
        let da = draft(c.maths, c.calculus, c.r1, "Monday", MON_9);
        let db = draft(c.maths, c.calculus, c.r2, "Tuesday", MON_9);
        let ha = tokio::spawn(async move { a.create_timetable_entry(id, da).await });
        let hb = tokio::spawn(async move { b.create_timetable_entry(id, db).await });
        let results = [ha.await.unwrap(), hb.await.unwrap()];

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let dupes = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyExists(_))))
            .count();
        assert_eq!((wins, dupes), (1, 1), "round {round}");
        assert_eq!(engine.entry_count(), 1);

        let winner = engine.get_timetable_entry(id).await.unwrap();
        engine.delete_timetable_entry(winner.id).await.unwrap();
        assert_eq!(engine.entry_count(), 0);
    }
}

// ── Update & delete ──────────────────────────────────────

#[tokio::test]
async fn update_into_occupied_triple_rejected() {
    let engine = Engine::new(test_wal_path("update_occupied.wal")).unwrap();
    let c = seed(&engine).await;
    let a = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();
    let b = engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "Monday", MON_10))
        .await
        .unwrap();

    let result = engine
        .update_timetable_entry(b.id, update(c.physics, c.r1, "Monday", MON_9))
        .await;
    match result {
        Err(EngineError::SlotAlreadyBooked { existing, .. }) => assert_eq!(existing, a.id),
        other => panic!("expected SlotAlreadyBooked, got {other:?}"),
    }
    assert_eq!(engine.get_timetable_entry(b.id).await, Some(b));
}

#[tokio::test]
async fn update_onto_own_triple_succeeds() {
    let engine = Engine::new(test_wal_path("update_own.wal")).unwrap();
    let c = seed(&engine).await;
    let e = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    // Only the course changes.
    let updated = engine
        .update_timetable_entry(e.id, update(c.physics, c.r1, "Monday", MON_9))
        .await
        .unwrap();
    assert_eq!(updated.course_id, c.physics);
    assert_eq!(updated.subject_id, c.calculus);
    assert_eq!(engine.entry_count(), 1);
}

#[tokio::test]
async fn update_moves_between_rooms() {
    let engine = Engine::new(test_wal_path("update_move.wal")).unwrap();
    let c = seed(&engine).await;
    let e = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    engine
        .update_timetable_entry(e.id, update(c.maths, c.r2, "Tuesday", MON_10))
        .await
        .unwrap();

    assert_eq!(engine.classroom_for_entry(&e.id), Some(c.r2));
    let free = engine
        .available_classrooms(Some("Monday"), Some(MON_9))
        .await
        .unwrap();
    assert_eq!(free.len(), 2, "old triple released");
    let free = engine
        .available_classrooms(Some("Tuesday"), Some(MON_10))
        .await
        .unwrap();
    assert_eq!(free.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c.r1]);
}

#[tokio::test]
async fn update_unknown_entry_or_target() {
    let engine = Engine::new(test_wal_path("update_unknown.wal")).unwrap();
    let c = seed(&engine).await;
    let missing = Ulid::new();
    assert!(matches!(
        engine
            .update_timetable_entry(missing, update(c.maths, c.r1, "Monday", MON_9))
            .await,
        Err(EngineError::NotFound(id)) if id == missing
    ));

    let e = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();
    let ghost_room = Ulid::new();
    assert!(matches!(
        engine
            .update_timetable_entry(e.id, update(c.maths, ghost_room, "Monday", MON_9))
            .await,
        Err(EngineError::NotFound(id)) if id == ghost_room
    ));
}

#[tokio::test]
async fn delete_frees_the_slot() {
    let engine = Engine::new(test_wal_path("delete_frees.wal")).unwrap();
    let c = seed(&engine).await;
    let e = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    let removed = engine.delete_timetable_entry(e.id).await.unwrap();
    assert_eq!(removed, e);
    assert_eq!(engine.entry_count(), 0);
    assert!(matches!(
        engine.delete_timetable_entry(e.id).await,
        Err(EngineError::NotFound(_))
    ));

    engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "Monday", MON_9))
        .await
        .unwrap();
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_booking_duality() {
    let engine = Engine::new(test_wal_path("availability_duality.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    for day in Day::ALL {
        for slot in [MON_9, MON_10] {
            let free = engine
                .available_classrooms(Some(day.as_str()), Some(slot))
                .await
                .unwrap();
            for room in [c.r1, c.r2] {
                let rs = engine.get_classroom(&room).unwrap();
                let booked = !rs
                    .read()
                    .await
                    .is_free(day, &slot.parse::<TimeSlot>().unwrap());
                assert_eq!(
                    free.iter().any(|r| r.id == room),
                    !booked,
                    "{day} {slot} {room}"
                );
            }
        }
    }
}

#[tokio::test]
async fn availability_scenario_and_idempotence() {
    let engine = Engine::new(test_wal_path("availability_scenario.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    let first = engine
        .available_classrooms(Some("Monday"), Some(MON_9))
        .await
        .unwrap();
    assert_eq!(
        first,
        vec![ClassroomInfo {
            id: c.r2,
            name: "R2".into(),
            capacity: 60
        }]
    );
    let second = engine
        .available_classrooms(Some("Monday"), Some(MON_9))
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn availability_input_errors() {
    let engine = Engine::new(test_wal_path("availability_inputs.wal")).unwrap();
    let _ = seed(&engine).await;

    assert!(matches!(
        engine.available_classrooms(None, Some(MON_9)).await,
        Err(EngineError::MissingParameter("day"))
    ));
    assert!(matches!(
        engine.available_classrooms(Some("Monday"), Some("")).await,
        Err(EngineError::MissingParameter("time_slot"))
    ));
    assert!(matches!(
        engine.available_classrooms(Some("Someday"), Some(MON_9)).await,
        Err(EngineError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn availability_malformed_slot_matches_nothing() {
    let engine = Engine::new(test_wal_path("availability_malformed.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();
    let free = engine
        .available_classrooms(Some("Monday"), Some("after lunch"))
        .await
        .unwrap();
    assert_eq!(free.len(), 2);
}

// ── Projection ───────────────────────────────────────────

#[tokio::test]
async fn admin_sees_everything_in_order() {
    let engine = Engine::new(test_wal_path("projection_admin.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r2, "Monday", MON_9))
        .await
        .unwrap();
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Tuesday", MON_9))
        .await
        .unwrap();
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r2, "Monday", MON_10))
        .await
        .unwrap();

    let rows = engine.list_timetable(&admin()).await;
    assert_eq!(rows.len(), engine.entry_count());
    let keys: Vec<_> = rows
        .iter()
        .map(|r| (r.course_name.as_str(), r.day, r.room_name.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("Maths", Day::Monday, "R2"),
            ("Maths", Day::Tuesday, "R1"),
            ("Physics", Day::Monday, "R2"),
        ]
    );
    assert_eq!(rows[0].subject_name, "Calculus");
    assert_eq!(rows[0].slot.to_string(), MON_10);
}

#[tokio::test]
async fn student_sees_only_enrolled_courses() {
    let engine = Engine::new(test_wal_path("projection_student.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r2, "Monday", MON_9))
        .await
        .unwrap();
    engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Tuesday", MON_9))
        .await
        .unwrap();

    let student = Credential::Student {
        user_id: Ulid::new(),
        course_ids: BTreeSet::from([c.maths]),
    };
    let rows = engine.list_timetable(&student).await;
    assert_eq!(rows.len(), 1);
    assert!(rows.iter().all(|r| r.course_id == c.maths));

    let nobody = Credential::Student {
        user_id: Ulid::new(),
        course_ids: BTreeSet::new(),
    };
    assert!(engine.list_timetable(&nobody).await.is_empty());
}

#[tokio::test]
async fn credential_snapshot_not_refreshed() {
    let engine = Engine::new(test_wal_path("credential_freeze.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r2, "Monday", MON_9))
        .await
        .unwrap();

    let sid = Ulid::new();
    engine
        .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
        .await
        .unwrap();
    engine.enroll(sid, c.maths).await.unwrap();

    let credential = crate::session::issue(&engine, "ada@uni.test").unwrap();
    engine.enroll(sid, c.physics).await.unwrap();

    // Enrolled in physics now, but the credential predates it.
    assert!(engine.list_timetable(&credential).await.is_empty());
    let fresh = crate::session::issue(&engine, "ada@uni.test").unwrap();
    assert_eq!(engine.list_timetable(&fresh).await.len(), 1);
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn delete_course_cascades_subjects() {
    let engine = Engine::new(test_wal_path("course_cascade.wal")).unwrap();
    let c = seed(&engine).await;
    engine
        .create_subject(Ulid::new(), "MATH102".into(), "Algebra".into(), c.maths)
        .await
        .unwrap();
    let sid = Ulid::new();
    engine
        .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
        .await
        .unwrap();
    engine.enroll(sid, c.maths).await.unwrap();

    assert_eq!(engine.delete_course(c.maths).await.unwrap(), 2);
    assert!(engine.list_subjects(Some(c.maths)).unwrap().is_empty());
    assert!(engine.enrolled_courses(&sid).is_empty());
    assert_eq!(engine.list_courses().len(), 1);

    // Codes are free again.
    let again = Ulid::new();
    engine
        .create_course(again, "MATH".into(), "Maths".into())
        .await
        .unwrap();
    engine
        .create_subject(Ulid::new(), "MATH101".into(), "Calculus".into(), again)
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_referenced_course_or_subject_refused() {
    let engine = Engine::new(test_wal_path("course_in_use.wal")).unwrap();
    let c = seed(&engine).await;
    let e = engine
        .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
        .await
        .unwrap();

    assert!(matches!(engine.delete_course(c.maths).await, Err(EngineError::InUse(id)) if id == c.maths));
    assert!(matches!(engine.delete_subject(c.calculus).await, Err(EngineError::InUse(_))));
    assert_eq!(engine.list_subjects(Some(c.maths)).unwrap().len(), 1);

    engine.delete_timetable_entry(e.id).await.unwrap();
    engine.delete_subject(c.calculus).await.unwrap();
    engine.delete_course(c.maths).await.unwrap();
}

#[tokio::test]
async fn subject_codes_unique() {
    let engine = Engine::new(test_wal_path("subject_codes.wal")).unwrap();
    let c = seed(&engine).await;
    let result = engine
        .create_subject(Ulid::new(), "MATH101".into(), "Calculus again".into(), c.physics)
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    let result = engine
        .create_subject(Ulid::new(), "X1".into(), "Orphan".into(), Ulid::new())
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn list_subjects_requires_course() {
    let engine = Engine::new(test_wal_path("list_subjects.wal")).unwrap();
    let c = seed(&engine).await;
    assert!(matches!(
        engine.list_subjects(None),
        Err(EngineError::MissingParameter("course_id"))
    ));
    assert!(engine.list_subjects(Some(Ulid::new())).unwrap().is_empty());
    let names: Vec<_> = engine
        .list_subjects(Some(c.physics))
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["Optics"]);
}

#[tokio::test]
async fn courses_with_subjects_groups() {
    let engine = Engine::new(test_wal_path("course_catalog.wal")).unwrap();
    let c = seed(&engine).await;
    let catalog = engine.courses_with_subjects();
    assert_eq!(catalog.len(), 2);
    // Ordered by course id; ids minted in the same millisecond compare at random.
    assert!(catalog[0].course.id < catalog[1].course.id);
    let subjects_of = |course: Ulid| -> Vec<Ulid> {
        catalog
            .iter()
            .find(|g| g.course.id == course)
            .map(|g| g.subjects.iter().map(|s| s.id).collect())
            .unwrap()
    };
    assert_eq!(subjects_of(c.maths), vec![c.calculus]);
    assert_eq!(subjects_of(c.physics), vec![c.optics]);
}

#[tokio::test]
async fn user_emails_unique_case_insensitively() {
    let engine = Engine::new(test_wal_path("user_emails.wal")).unwrap();
    engine
        .register_user(Ulid::new(), "Ada".into(), "ada@uni.test".into(), Role::Student)
        .await
        .unwrap();
    let result = engine
        .register_user(Ulid::new(), "Imposter".into(), "ADA@uni.test".into(), Role::Student)
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    assert!(engine.find_user_by_email("Ada@Uni.Test").is_some());

    let result = engine
        .register_user(Ulid::new(), "Bob".into(), "not-an-email".into(), Role::Student)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidParameter(_))));
}

#[tokio::test]
async fn student_update_and_delete() {
    let engine = Engine::new(test_wal_path("student_crud.wal")).unwrap();
    let c = seed(&engine).await;
    let sid = Ulid::new();
    engine
        .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
        .await
        .unwrap();
    engine.assign_course(sid, c.physics).await.unwrap();

    engine
        .update_student(sid, "Ada L.".into(), "ada.l@uni.test".into())
        .await
        .unwrap();
    assert!(engine.find_user_by_email("ada@uni.test").is_none());
    assert_eq!(engine.find_user_by_email("ada.l@uni.test").unwrap().name, "Ada L.");

    let rows = engine.list_students();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].course_name.as_deref(), Some("Physics"));

    engine.delete_student(sid).await.unwrap();
    assert!(engine.list_students().is_empty());
    assert!(engine.enrolled_courses(&sid).is_empty());

    // Admins are not students.
    let admin_id = engine.ensure_admin("root@uni.test", "Root").await.unwrap();
    assert!(matches!(
        engine.delete_student(admin_id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn enrollment_operations() {
    let engine = Engine::new(test_wal_path("enrollment_ops.wal")).unwrap();
    let c = seed(&engine).await;
    let sid = Ulid::new();
    engine
        .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
        .await
        .unwrap();

    engine.enroll(sid, c.maths).await.unwrap();
    engine.enroll(sid, c.maths).await.unwrap();
    engine.enroll(sid, c.physics).await.unwrap();
    assert_eq!(engine.enrolled_courses(&sid), BTreeSet::from([c.maths, c.physics]));
    assert_eq!(engine.list_students().len(), 2);

    engine.assign_course(sid, c.physics).await.unwrap();
    assert_eq!(engine.enrolled_courses(&sid), BTreeSet::from([c.physics]));

    engine.unenroll(sid, c.physics).await.unwrap();
    assert!(engine.student_courses(Some(sid)).unwrap().is_empty());
    assert!(matches!(
        engine.unenroll(sid, c.physics).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.enroll(sid, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.student_courses(None),
        Err(EngineError::MissingParameter("student_id"))
    ));
}

#[tokio::test]
async fn ensure_admin_is_idempotent() {
    let engine = Engine::new(test_wal_path("ensure_admin.wal")).unwrap();
    let first = engine.ensure_admin("admin@localhost", "Administrator").await.unwrap();
    let second = engine.ensure_admin("ADMIN@localhost", "Administrator").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.get_user(&first).unwrap().role, Role::Admin);
}

#[tokio::test]
async fn catalog_limits() {
    let engine = Engine::new(test_wal_path("catalog_limits.wal")).unwrap();
    let long = "x".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        engine.create_classroom(Ulid::new(), long, 10).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine
            .create_classroom(Ulid::new(), "Hall".into(), MAX_CLASSROOM_CAPACITY + 1)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.create_course(Ulid::new(), " ".into(), "Maths".into()).await,
        Err(EngineError::MissingParameter("code"))
    ));
}

// ── WAL replay & compaction ──────────────────────────────

#[tokio::test]
async fn wal_replay_restores_everything() {
    let path = test_wal_path("replay_full.wal");
    let sid = Ulid::new();
    let (c, moved, deleted) = {
        let engine = Engine::new(path.clone()).unwrap();
        let c = seed(&engine).await;
        engine
            .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
            .await
            .unwrap();
        engine.enroll(sid, c.maths).await.unwrap();
        let moved = engine
            .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
            .await
            .unwrap();
        engine
            .update_timetable_entry(moved.id, update(c.maths, c.r2, "Friday", MON_10))
            .await
            .unwrap();
        let deleted = engine
            .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r1, "Monday", MON_10))
            .await
            .unwrap();
        engine.delete_timetable_entry(deleted.id).await.unwrap();
        (c, moved.id, deleted.id)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_classrooms().await.len(), 2);
    assert_eq!(engine.list_courses().len(), 2);
    assert_eq!(engine.enrolled_courses(&sid), BTreeSet::from([c.maths]));
    assert_eq!(engine.entry_count(), 1);
    let entry = engine.get_timetable_entry(moved).await.unwrap();
    assert_eq!(entry.classroom_id, c.r2);
    assert_eq!((entry.day, entry.slot), (Day::Friday, TimeSlot::hours(10, 11)));
    assert!(engine.get_timetable_entry(deleted).await.is_none());

    // Replayed state still guards the triple.
    let result = engine
        .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r2, "Friday", MON_10))
        .await;
    assert!(matches!(result, Err(EngineError::SlotAlreadyBooked { .. })));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction_state.wal");
    let sid = Ulid::new();
    let c = {
        let engine = Engine::new(path.clone()).unwrap();
        let c = seed(&engine).await;
        engine
            .register_user(sid, "Ada".into(), "ada@uni.test".into(), Role::Student)
            .await
            .unwrap();
        engine.enroll(sid, c.physics).await.unwrap();
        for _ in 0..10 {
            let e = engine
                .create_timetable_entry(Ulid::new(), draft(c.maths, c.calculus, c.r1, "Monday", MON_9))
                .await
                .unwrap();
            engine.delete_timetable_entry(e.id).await.unwrap();
        }
        engine
            .create_timetable_entry(Ulid::new(), draft(c.physics, c.optics, c.r2, "Monday", MON_9))
            .await
            .unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 20);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        c
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.entry_count(), 1);
    assert_eq!(engine.list_students().len(), 1);
    assert_eq!(engine.enrolled_courses(&sid), BTreeSet::from([c.physics]));
    let credential = crate::session::issue(&engine, "ada@uni.test").unwrap();
    assert_eq!(engine.list_timetable(&credential).await.len(), 1);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_classroom(Ulid::new(), format!("R{i}"), 20).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_classrooms().await.len(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_classrooms().await.len(), n);
}
