//! SQLite-backed roster and attendance book.

use chrono::NaiveDate;
use rollcall_core::attendance::RecordPatch;
use rollcall_core::student::StudentPatch;
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, Embedding, NewStudent, StoreError,
    Student, StudentDirectory, StudentId, StudentStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS students (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    code            TEXT NOT NULL UNIQUE,
    first_name      TEXT NOT NULL,
    last_name       TEXT NOT NULL,
    class_level     TEXT NOT NULL DEFAULT '',
    room            TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL DEFAULT 'active',
    face_descriptor TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    student_id  INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
    date        TEXT NOT NULL,
    check_in    TEXT,
    check_out   TEXT,
    status      TEXT NOT NULL,
    UNIQUE (student_id, date)
);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

const STUDENT_COLUMNS: &str =
    "id, code, first_name, last_name, class_level, room, status, face_descriptor";
const RECORD_COLUMNS: &str = "id, student_id, date, check_in, check_out, status";

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Raw student row before validation.
struct StudentRow {
    id: StudentId,
    code: String,
    first_name: String,
    last_name: String,
    class_level: String,
    room: String,
    status: String,
    face_descriptor: Option<String>,
}

impl StudentRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            code: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            class_level: row.get(4)?,
            room: row.get(5)?,
            status: row.get(6)?,
            face_descriptor: row.get(7)?,
        })
    }

    fn into_student(self) -> Result<Student, StoreError> {
        let status = StudentStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!("student {}: bad status {:?}", self.id, self.status))
        })?;
        let face_descriptor = self
            .face_descriptor
            .map(|json| serde_json::from_str::<Embedding>(&json))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("student {}: bad descriptor: {e}", self.id)))?;
        Ok(Student {
            id: self.id,
            code: self.code,
            first_name: self.first_name,
            last_name: self.last_name,
            class_level: self.class_level,
            room: self.room,
            status,
            face_descriptor,
        })
    }
}

/// Raw attendance row before validation.
struct RecordRow {
    id: String,
    student_id: StudentId,
    date: String,
    check_in: Option<String>,
    check_out: Option<String>,
    status: String,
}

impl RecordRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            date: row.get(2)?,
            check_in: row.get(3)?,
            check_out: row.get(4)?,
            status: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("attendance {}: bad {what}", self.id));
        let id = Uuid::parse_str(&self.id).map_err(|_| corrupt("id"))?;
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT).map_err(|_| corrupt("date"))?;
        let check_in = self
            .check_in
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| corrupt("check_in"))?;
        let check_out = self
            .check_out
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| corrupt("check_out"))?;
        let status = AttendanceStatus::parse(&self.status).ok_or_else(|| corrupt("status"))?;
        Ok(AttendanceRecord {
            id,
            student_id: self.student_id,
            date,
            check_in,
            check_out,
            status,
        })
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    fn student_by_id(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                params![id],
                StudentRow::read,
            )
            .optional()
            .map_err(backend)?
            .map(StudentRow::into_student)
            .transpose()
    }

    fn record_by_id(&self, id: Uuid) -> Result<Option<AttendanceRecord>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM attendance WHERE id = ?1"),
                params![id.to_string()],
                RecordRow::read,
            )
            .optional()
            .map_err(backend)?
            .map(RecordRow::into_record)
            .transpose()
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl StudentDirectory for SqliteStore {
    fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY id"))
            .map_err(backend)?;
        let rows = stmt
            .query_map([], StudentRow::read)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(StudentRow::into_student).collect()
    }

    fn get_student(&self, id: StudentId) -> Result<Option<Student>, StoreError> {
        self.student_by_id(id)
    }

    fn insert_student(&mut self, new: NewStudent) -> Result<Student, StoreError> {
        let result = self.conn.execute(
            "INSERT INTO students (code, first_name, last_name, class_level, room, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.code,
                new.first_name,
                new.last_name,
                new.class_level,
                new.room,
                new.status.as_str()
            ],
        );
        match result {
            Ok(_) => Ok(new.into_student(self.conn.last_insert_rowid())),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateCode(new.code)),
            Err(e) => Err(backend(e)),
        }
    }

    fn update_student(&mut self, id: StudentId, patch: StudentPatch) -> Result<Student, StoreError> {
        let mut student = self
            .student_by_id(id)?
            .ok_or(StoreError::StudentNotFound(id))?;
        student.apply(patch);

        let descriptor = student
            .face_descriptor
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(format!("encoding descriptor: {e}")))?;
        self.conn
            .execute(
                "UPDATE students SET status = ?1, face_descriptor = ?2 WHERE id = ?3",
                params![student.status.as_str(), descriptor, id],
            )
            .map_err(backend)?;
        Ok(student)
    }

    fn remove_student(&mut self, id: StudentId) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM students WHERE id = ?1", params![id])
            .map_err(backend)?;
        Ok(n > 0)
    }
}

impl AttendanceStore for SqliteStore {
    fn find_record(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance WHERE student_id = ?1 AND date = ?2"
                ),
                params![student_id, date.format(DATE_FORMAT).to_string()],
                RecordRow::read,
            )
            .optional()
            .map_err(backend)?
            .map(RecordRow::into_record)
            .transpose()
    }

    fn insert_record(&mut self, record: AttendanceRecord) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO attendance (id, student_id, date, check_in, check_out, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.student_id,
                record.date.format(DATE_FORMAT).to_string(),
                record.check_in.map(|t| t.to_string()),
                record.check_out.map(|t| t.to_string()),
                record.status.as_str(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateRecord {
                student_id: record.student_id,
                date: record.date,
            }),
            Err(e) => Err(backend(e)),
        }
    }

    fn update_record(&mut self, id: Uuid, patch: RecordPatch) -> Result<AttendanceRecord, StoreError> {
        let mut record = self.record_by_id(id)?.ok_or(StoreError::RecordNotFound(id))?;
        record.apply(patch);
        self.conn
            .execute(
                "UPDATE attendance SET check_in = ?1, check_out = ?2, status = ?3 WHERE id = ?4",
                params![
                    record.check_in.map(|t| t.to_string()),
                    record.check_out.map(|t| t.to_string()),
                    record.status.as_str(),
                    id.to_string(),
                ],
            )
            .map_err(backend)?;
        Ok(record)
    }

    fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM attendance WHERE date = ?1 ORDER BY check_in, student_id"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string()], RecordRow::read)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    fn clear_records(&mut self) -> Result<usize, StoreError> {
        self.conn.execute("DELETE FROM attendance", []).map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::recorder::DEFAULT_FEED_LEN;
    use rollcall_core::{AttendanceRecorder, CommitError, Direction, Settings};

    fn new_student(code: &str) -> NewStudent {
        NewStudent {
            code: code.into(),
            first_name: "First".into(),
            last_name: code.into(),
            class_level: "M.1".into(),
            room: "3".into(),
            status: StudentStatus::Active,
        }
    }

    fn at(h: u32, m: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_student_round_trip_with_descriptor() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let s = store.insert_student(new_student("S-1")).unwrap();
        assert!(!s.face_registered());

        let updated = store
            .update_student(s.id, StudentPatch::register_face(Embedding::new(vec![0.25, -0.5])))
            .unwrap();
        assert!(updated.face_registered());

        let loaded = store.get_student(s.id).unwrap().unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(loaded.face_descriptor.unwrap().values, vec![0.25, -0.5]);
    }

    #[test]
    fn test_duplicate_code() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert_student(new_student("S-1")).unwrap();
        assert_eq!(
            store.insert_student(new_student("S-1")).unwrap_err(),
            StoreError::DuplicateCode("S-1".into())
        );
    }

    #[test]
    fn test_clear_face() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let s = store.insert_student(new_student("S-1")).unwrap();
        store
            .update_student(s.id, StudentPatch::register_face(Embedding::new(vec![0.1; 3])))
            .unwrap();
        store.update_student(s.id, StudentPatch::clear_face()).unwrap();
        assert!(!store.get_student(s.id).unwrap().unwrap().face_registered());
    }

    #[test]
    fn test_recorder_over_sqlite() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let s = store.insert_student(new_student("S-1")).unwrap();
        let mut rec = AttendanceRecorder::new(store, Settings::default(), DEFAULT_FEED_LEN);

        rec.commit(s.id, Direction::CheckIn, at(8, 45)).unwrap();
        assert!(matches!(
            rec.commit(s.id, Direction::CheckIn, at(8, 50)),
            Err(CommitError::AlreadyCheckedIn(_))
        ));
        let out = rec.commit(s.id, Direction::CheckOut, at(15, 50)).unwrap();
        assert_eq!(out.status, AttendanceStatus::Late);

        let records = rec.store().records_for_date(at(0, 0).date()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].check_in.map(|t| t.to_string()).as_deref(), Some("08:45"));
        assert_eq!(records[0].check_out.map(|t| t.to_string()).as_deref(), Some("15:50"));
    }

    #[test]
    fn test_unique_record_per_day() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let s = store.insert_student(new_student("S-1")).unwrap();
        let record = |id| AttendanceRecord {
            id,
            student_id: s.id,
            date: at(0, 0).date(),
            check_in: None,
            check_out: None,
            status: AttendanceStatus::Absent,
        };
        store.insert_record(record(Uuid::new_v4())).unwrap();
        assert!(matches!(
            store.insert_record(record(Uuid::new_v4())),
            Err(StoreError::DuplicateRecord { .. })
        ));
    }

    #[test]
    fn test_record_requires_student() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let orphan = AttendanceRecord {
            id: Uuid::new_v4(),
            student_id: 99,
            date: at(0, 0).date(),
            check_in: None,
            check_out: None,
            status: AttendanceStatus::Absent,
        };
        assert!(matches!(store.insert_record(orphan), Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_remove_student_cascades() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let s = store.insert_student(new_student("S-1")).unwrap();
        let mut rec = AttendanceRecorder::new(store, Settings::default(), DEFAULT_FEED_LEN);
        rec.commit(s.id, Direction::CheckIn, at(8, 0)).unwrap();

        let store = rec.store_mut();
        assert!(store.remove_student(s.id).unwrap());
        assert!(store.records_for_date(at(0, 0).date()).unwrap().is_empty());
        assert!(!store.remove_student(s.id).unwrap());
    }

    #[test]
    fn test_clear_records() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert_student(new_student("A")).unwrap();
        let b = store.insert_student(new_student("B")).unwrap();
        let mut rec = AttendanceRecorder::new(store, Settings::default(), DEFAULT_FEED_LEN);
        rec.commit(a.id, Direction::CheckIn, at(8, 0)).unwrap();
        rec.commit(b.id, Direction::CheckIn, at(8, 1)).unwrap();
        assert_eq!(rec.store_mut().clear_records().unwrap(), 2);
    }
}
