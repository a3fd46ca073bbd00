use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::availability::sort_classrooms;
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_classrooms(&self) -> Vec<ClassroomInfo> {
        let mut rooms = Vec::with_capacity(self.classrooms.len());
        for (_, rs) in self.classroom_handles() {
            rooms.push(rs.read().await.info());
        }
        sort_classrooms(&mut rooms);
        rooms
    }

    pub fn list_courses(&self) -> Vec<Course> {
        let mut courses: Vec<Course> = self.courses.iter().map(|c| c.value().clone()).collect();
        courses.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.id.cmp(&b.id)));
        courses
    }

    /// Subjects of one course by code. An unknown course has no subjects.
    pub fn list_subjects(&self, course_id: Option<Ulid>) -> Result<Vec<Subject>, EngineError> {
        let course_id = course_id.ok_or(EngineError::MissingParameter("course_id"))?;
        let mut subjects: Vec<Subject> = self
            .subjects
            .iter()
            .filter(|s| s.course_id == course_id)
            .map(|s| s.value().clone())
            .collect();
        subjects.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(subjects)
    }

    /// Every course with its subjects, courses and subjects in id (creation) order.
    pub fn courses_with_subjects(&self) -> Vec<CourseWithSubjects> {
        let mut courses: Vec<Course> = self.courses.iter().map(|c| c.value().clone()).collect();
        courses.sort_by_key(|c| c.id);
        courses
            .into_iter()
            .map(|course| {
                let mut subjects: Vec<Subject> = self
                    .subjects
                    .iter()
                    .filter(|s| s.course_id == course.id)
                    .map(|s| s.value().clone())
                    .collect();
                subjects.sort_by_key(|s| s.id);
                CourseWithSubjects { course, subjects }
            })
            .collect()
    }

    /// One row per (student, course); a student with no course gets one row
    /// without. Ordered by student name, then course name.
    pub fn list_students(&self) -> Vec<StudentRow> {
        let mut rows = Vec::new();
        for user in self.users.iter().filter(|u| u.role == Role::Student) {
            let courses: Vec<Course> = self
                .enrolled_courses(&user.id)
                .iter()
                .filter_map(|cid| self.courses.get(cid).map(|c| c.value().clone()))
                .collect();
            if courses.is_empty() {
                rows.push(StudentRow {
                    id: user.id,
                    name: user.name.clone(),
                    email: user.email.clone(),
                    course_id: None,
                    course_name: None,
                });
            }
            for course in courses {
                rows.push(StudentRow {
                    id: user.id,
                    name: user.name.clone(),
                    email: user.email.clone(),
                    course_id: Some(course.id),
                    course_name: Some(course.name),
                });
            }
        }
        rows.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.course_name.cmp(&b.course_name))
        });
        rows
    }

    /// Courses a student is enrolled in right now, by name.
    pub fn student_courses(&self, student_id: Option<Ulid>) -> Result<Vec<Course>, EngineError> {
        let student_id = student_id.ok_or(EngineError::MissingParameter("student_id"))?;
        let mut courses: Vec<Course> = self
            .enrolled_courses(&student_id)
            .iter()
            .filter_map(|cid| self.courses.get(cid).map(|c| c.value().clone()))
            .collect();
        courses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(courses)
    }

    pub fn enrolled_courses(&self, student_id: &Ulid) -> BTreeSet<Ulid> {
        self.enrollments
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Case-insensitive.
    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(&email.trim().to_lowercase())?;
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn entry_count(&self) -> usize {
        self.entry_to_classroom.len()
    }
}
