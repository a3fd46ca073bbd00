use std::collections::BTreeSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_text(value: &str, name: &'static str, max_len: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::MissingParameter(name));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(match name {
            "code" => "code too long",
            "email" => "email too long",
            _ => "name too long",
        }));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), EngineError> {
    validate_text(email, "email", MAX_EMAIL_LEN)?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(EngineError::InvalidParameter(format!("not an email address: {email:?}"))),
    }
}

impl Engine {
    // ── Classrooms ───────────────────────────────────────────

    pub async fn create_classroom(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
    ) -> Result<ClassroomInfo, EngineError> {
        validate_text(&name, "name", MAX_NAME_LEN)?;
        if capacity > MAX_CLASSROOM_CAPACITY {
            return Err(EngineError::LimitExceeded("classroom capacity too large"));
        }

        let _catalog = self.catalog_lock.write().await;
        if self.classrooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("classroom {id}")));
        }
        if self.classrooms.len() >= MAX_CLASSROOMS {
            return Err(EngineError::LimitExceeded("too many classrooms"));
        }

        let event = Event::ClassroomCreated {
            id,
            name: name.clone(),
            capacity,
        };
        self.persist_catalog(&event).await?;
        info!("created classroom {name:?} ({id}), capacity {capacity}");
        Ok(ClassroomInfo { id, name, capacity })
    }

    // ── Courses & subjects ───────────────────────────────────

    pub async fn create_course(
        &self,
        id: Ulid,
        code: String,
        name: String,
    ) -> Result<Course, EngineError> {
        validate_text(&code, "code", MAX_CODE_LEN)?;
        validate_text(&name, "name", MAX_NAME_LEN)?;

        let _catalog = self.catalog_lock.write().await;
        if self.courses.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("course {id}")));
        }
        if self.courses.len() >= MAX_COURSES {
            return Err(EngineError::LimitExceeded("too many courses"));
        }

        let event = Event::CourseCreated {
            id,
            code: code.clone(),
            name: name.clone(),
        };
        self.persist_catalog(&event).await?;
        info!("created course {code} ({id})");
        Ok(Course { id, code, name })
    }

    /// Delete a course together with its subjects. One WAL event covers both,
    /// so replay never sees one without the other. Returns the number of
    /// subjects removed.
    pub async fn delete_course(&self, id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.courses.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.is_referenced(|e| e.course_id == id).await {
            return Err(EngineError::InUse(id));
        }

        let subjects = self.subjects.iter().filter(|s| s.course_id == id).count();
        self.persist_catalog(&Event::CourseDeleted { id }).await?;
        info!("deleted course {id} and {subjects} subject(s)");
        Ok(subjects)
    }

    pub async fn create_subject(
        &self,
        id: Ulid,
        code: String,
        name: String,
        course_id: Ulid,
    ) -> Result<Subject, EngineError> {
        validate_text(&code, "code", MAX_CODE_LEN)?;
        validate_text(&name, "name", MAX_NAME_LEN)?;

        let _catalog = self.catalog_lock.write().await;
        if !self.courses.contains_key(&course_id) {
            return Err(EngineError::NotFound(course_id));
        }
        if self.subjects.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("subject {id}")));
        }
        if self.subject_codes.contains_key(&code) {
            return Err(EngineError::AlreadyExists(format!("subject code {code}")));
        }
        if self.subjects.len() >= MAX_SUBJECTS {
            return Err(EngineError::LimitExceeded("too many subjects"));
        }

        let event = Event::SubjectCreated {
            id,
            code: code.clone(),
            name: name.clone(),
            course_id,
        };
        self.persist_catalog(&event).await?;
        info!("created subject {code} ({id}) in course {course_id}");
        Ok(Subject {
            id,
            code,
            name,
            course_id,
        })
    }

    pub async fn delete_subject(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        if !self.subjects.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.is_referenced(|e| e.subject_id == id).await {
            return Err(EngineError::InUse(id));
        }
        self.persist_catalog(&Event::SubjectDeleted { id }).await?;
        info!("deleted subject {id}");
        Ok(())
    }

    /// Whether any booking matches. Callers hold the catalog write lock, so
    /// no new booking can appear while this scans.
    async fn is_referenced(&self, pred: impl Fn(&TimetableEntry) -> bool) -> bool {
        for (_, rs) in self.classroom_handles() {
            let guard = rs.read().await;
            if guard.entries().any(&pred) {
                return true;
            }
        }
        false
    }

    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    ) -> Result<User, EngineError> {
        validate_text(&name, "name", MAX_NAME_LEN)?;
        validate_email(&email)?;

        let _catalog = self.catalog_lock.write().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }
        if self.emails.contains_key(&email.to_lowercase()) {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
            email: email.clone(),
            role,
        };
        self.persist_catalog(&event).await?;
        info!("registered {role} {email} ({id})");
        Ok(User {
            id,
            name,
            email,
            role,
        })
    }

    fn ensure_student(&self, id: Ulid) -> Result<(), EngineError> {
        match self.users.get(&id) {
            Some(user) if user.role == Role::Student => Ok(()),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    pub async fn update_student(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<User, EngineError> {
        validate_text(&name, "name", MAX_NAME_LEN)?;
        validate_email(&email)?;

        let _catalog = self.catalog_lock.write().await;
        self.ensure_student(id)?;
        if let Some(owner) = self.emails.get(&email.to_lowercase())
            && *owner != id
        {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }

        let event = Event::UserUpdated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.persist_catalog(&event).await?;
        info!("updated student {id}");
        Ok(User {
            id,
            name,
            email,
            role: Role::Student,
        })
    }

    pub async fn delete_student(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        self.ensure_student(id)?;
        self.persist_catalog(&Event::UserDeleted { id }).await?;
        info!("deleted student {id}");
        Ok(())
    }

    /// Create the admin account if no user holds this email. Returns the id of
    /// the account now holding it.
    pub async fn ensure_admin(&self, email: &str, name: &str) -> Result<Ulid, EngineError> {
        if let Some(user) = self.find_user_by_email(email) {
            if user.role != Role::Admin {
                warn!("bootstrap admin email {email} belongs to a {}", user.role);
            }
            return Ok(user.id);
        }
        let user = self
            .register_user(Ulid::new(), name.to_string(), email.to_string(), Role::Admin)
            .await?;
        Ok(user.id)
    }

    // ── Enrollment ───────────────────────────────────────────
    //
    // Credentials already issued keep their snapshot; nothing here reaches them.

    pub async fn enroll(&self, student_id: Ulid, course_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        self.ensure_student(student_id)?;
        if !self.courses.contains_key(&course_id) {
            return Err(EngineError::NotFound(course_id));
        }
        let current = self.enrolled_courses(&student_id);
        if current.contains(&course_id) {
            return Ok(());
        }
        if current.len() >= MAX_COURSES_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many courses for student"));
        }

        self.persist_catalog(&Event::Enrolled {
            student_id,
            course_id,
        })
        .await?;
        info!("enrolled student {student_id} in course {course_id}");
        Ok(())
    }

    /// Replace the student's enrollment with exactly one course.
    pub async fn assign_course(&self, student_id: Ulid, course_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        self.ensure_student(student_id)?;
        if !self.courses.contains_key(&course_id) {
            return Err(EngineError::NotFound(course_id));
        }
        self.persist_catalog(&Event::EnrollmentReplaced {
            student_id,
            course_ids: vec![course_id],
        })
        .await?;
        info!("assigned student {student_id} to course {course_id}");
        Ok(())
    }

    pub async fn unenroll(&self, student_id: Ulid, course_id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.write().await;
        self.ensure_student(student_id)?;
        let mut remaining: BTreeSet<Ulid> = self.enrolled_courses(&student_id);
        if !remaining.remove(&course_id) {
            return Err(EngineError::NotFound(course_id));
        }
        self.persist_catalog(&Event::EnrollmentReplaced {
            student_id,
            course_ids: remaining.into_iter().collect(),
        })
        .await?;
        info!("unenrolled student {student_id} from course {course_id}");
        Ok(())
    }
}
