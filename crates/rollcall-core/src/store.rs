//! Persistence seams for the roster and attendance records.
//!
//! The workflow only talks to these traits. `MemoryStore` backs tests and
//! ephemeral deployments; the daemon provides a SQLite implementation.

use crate::attendance::{AttendanceRecord, RecordPatch};
use crate::student::{NewStudent, Student, StudentId, StudentPatch, StudentStatus};
use crate::types::Embedding;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("student {0} not found")]
    StudentNotFound(StudentId),
    #[error("attendance record {0} not found")]
    RecordNotFound(Uuid),
    #[error("student code {0:?} already exists")]
    DuplicateCode(String),
    #[error("student {student_id} already has a record for {date}")]
    DuplicateRecord { student_id: StudentId, date: NaiveDate },
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("store is unavailable")]
    Unavailable,
}

pub trait StudentDirectory {
    fn list_students(&self) -> Result<Vec<Student>, StoreError>;
    fn get_student(&self, id: StudentId) -> Result<Option<Student>, StoreError>;
    fn insert_student(&mut self, new: NewStudent) -> Result<Student, StoreError>;
    fn update_student(&mut self, id: StudentId, patch: StudentPatch) -> Result<Student, StoreError>;
    /// Remove a student and every attendance record that references them.
    fn remove_student(&mut self, id: StudentId) -> Result<bool, StoreError>;
}

pub trait AttendanceStore {
    fn find_record(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;
    fn insert_record(&mut self, record: AttendanceRecord) -> Result<(), StoreError>;
    fn update_record(&mut self, id: Uuid, patch: RecordPatch) -> Result<AttendanceRecord, StoreError>;
    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError>;
    /// Delete every attendance record. Returns how many were removed.
    fn clear_records(&mut self) -> Result<usize, StoreError>;
}

/// Active students with a registered face, ordered by id.
pub fn registered_faces<D: StudentDirectory + ?Sized>(
    directory: &D,
) -> Result<Vec<(Student, Embedding)>, StoreError> {
    let mut faces: Vec<(Student, Embedding)> = directory
        .list_students()?
        .into_iter()
        .filter(|s| s.status == StudentStatus::Active)
        .filter_map(|s| {
            let embedding = s.face_descriptor.clone()?;
            Some((s, embedding))
        })
        .collect();
    faces.sort_by_key(|(s, _)| s.id);
    Ok(faces)
}

/// In-memory roster and attendance book.
#[derive(Debug, Default)]
pub struct MemoryStore {
    students: BTreeMap<StudentId, Student>,
    records: Vec<AttendanceRecord>,
    next_id: StudentId,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StudentDirectory for MemoryStore {
    fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(self.students.values().cloned().collect())
    }

    fn get_student(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        Ok(self.students.get(&id).cloned())
    }

    fn insert_student(&mut self, new: NewStudent) -> Result<Student, StoreError> {
        if self.students.values().any(|s| s.code == new.code) {
            return Err(StoreError::DuplicateCode(new.code));
        }
        self.next_id += 1;
        let student = new.into_student(self.next_id);
        self.students.insert(student.id, student.clone());
        Ok(student)
    }

    fn update_student(&mut self, id: StudentId, patch: StudentPatch) -> Result<Student, StoreError> {
        let student = self
            .students
            .get_mut(&id)
            .ok_or(StoreError::StudentNotFound(id))?;
        student.apply(patch);
        Ok(student.clone())
    }

    fn remove_student(&mut self, id: StudentId) -> Result<bool, StoreError> {
        let removed = self.students.remove(&id).is_some();
        if removed {
            self.records.retain(|r| r.student_id != id);
        }
        Ok(removed)
    }
}

impl AttendanceStore for MemoryStore {
    fn find_record(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.student_id == student_id && r.date == date)
            .cloned())
    }

    fn insert_record(&mut self, record: AttendanceRecord) -> Result<(), StoreError> {
        if self
            .records
            .iter()
            .any(|r| r.student_id == record.student_id && r.date == record.date)
        {
            return Err(StoreError::DuplicateRecord {
                student_id: record.student_id,
                date: record.date,
            });
        }
        self.records.push(record);
        Ok(())
    }

    fn update_record(&mut self, id: Uuid, patch: RecordPatch) -> Result<AttendanceRecord, StoreError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::RecordNotFound(id))?;
        record.apply(patch);
        Ok(record.clone())
    }

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.records.iter().filter(|r| r.date == date).cloned().collect())
    }

    fn clear_records(&mut self) -> Result<usize, StoreError> {
        let n = self.records.len();
        self.records.clear();
        Ok(n)
    }
}
