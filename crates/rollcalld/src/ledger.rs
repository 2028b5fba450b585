//! Single-writer ledger thread.
//!
//! The roster and attendance book live on one OS thread together with the
//! `AttendanceRecorder`. Every read and write is a request over a channel,
//! answered through a oneshot, so commits from the recognition task and
//! roster edits from D-Bus never interleave.

use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::matcher::LabeledEmbedding;
use rollcall_core::quality::register_face;
use rollcall_core::store::registered_faces;
use rollcall_core::student::StudentPatch;
use rollcall_core::{
    AttendanceRecorder, AttendanceStatus, AttendanceStore, CaptureError, CommitError,
    CommitOutcome, Direction, Embedding, NewStudent, StoreError, Student, StudentDirectory,
    StudentId, TimeOfDay,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// One line of the daily report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub student_id: StudentId,
    pub code: String,
    pub name: String,
    pub check_in: Option<TimeOfDay>,
    pub check_out: Option<TimeOfDay>,
    pub status: AttendanceStatus,
}

/// Recent activity plus the number of commits in the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub session_count: u32,
    pub recent: Vec<CommitOutcome>,
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum LedgerRequest {
    Commit {
        student_id: StudentId,
        direction: Direction,
        now: NaiveDateTime,
        reply: oneshot::Sender<Result<CommitOutcome, CommitError>>,
    },
    Gallery {
        reply: Reply<Vec<LabeledEmbedding>>,
    },
    RegisterFace {
        student_id: StudentId,
        embedding: Embedding,
        reply: oneshot::Sender<Result<Student, CaptureError>>,
    },
    ClearFace {
        student_id: StudentId,
        reply: Reply<Student>,
    },
    GetStudent {
        student_id: StudentId,
        reply: Reply<Option<Student>>,
    },
    ListStudents {
        reply: Reply<Vec<Student>>,
    },
    AddStudent {
        student: NewStudent,
        reply: Reply<Student>,
    },
    RemoveStudent {
        student_id: StudentId,
        reply: Reply<bool>,
    },
    Report {
        date: NaiveDate,
        reply: Reply<Vec<ReportRow>>,
    },
    Activity {
        reply: oneshot::Sender<Activity>,
    },
    ResetSessionCount,
    ClearAttendance {
        reply: Reply<usize>,
    },
}

/// Clone-safe handle to the ledger thread.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerRequest>,
}

impl LedgerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> LedgerRequest,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StoreError::Unavailable)?;
        reply_rx.await.map_err(|_| StoreError::Unavailable)?
    }

    /// Apply the check-in/check-out rules and persist the result.
    pub async fn commit(
        &self,
        student_id: StudentId,
        direction: Direction,
        now: NaiveDateTime,
    ) -> Result<CommitOutcome, CommitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerRequest::Commit {
                student_id,
                direction,
                now,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CommitError::Store(StoreError::Unavailable))?;
        reply_rx
            .await
            .map_err(|_| CommitError::Store(StoreError::Unavailable))?
    }

    /// Snapshot of every active student with a registered face.
    pub async fn gallery(&self) -> Result<Vec<LabeledEmbedding>, StoreError> {
        self.call(|reply| LedgerRequest::Gallery { reply }).await
    }

    pub async fn register_face(
        &self,
        student_id: StudentId,
        embedding: Embedding,
    ) -> Result<Student, CaptureError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerRequest::RegisterFace {
                student_id,
                embedding,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CaptureError::Store(StoreError::Unavailable))?;
        reply_rx
            .await
            .map_err(|_| CaptureError::Store(StoreError::Unavailable))?
    }

    pub async fn clear_face(&self, student_id: StudentId) -> Result<Student, StoreError> {
        self.call(|reply| LedgerRequest::ClearFace { student_id, reply })
            .await
    }

    pub async fn get_student(&self, student_id: StudentId) -> Result<Option<Student>, StoreError> {
        self.call(|reply| LedgerRequest::GetStudent { student_id, reply })
            .await
    }

    pub async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        self.call(|reply| LedgerRequest::ListStudents { reply }).await
    }

    pub async fn add_student(&self, student: NewStudent) -> Result<Student, StoreError> {
        self.call(|reply| LedgerRequest::AddStudent { student, reply })
            .await
    }

    pub async fn remove_student(&self, student_id: StudentId) -> Result<bool, StoreError> {
        self.call(|reply| LedgerRequest::RemoveStudent { student_id, reply })
            .await
    }

    pub async fn report(&self, date: NaiveDate) -> Result<Vec<ReportRow>, StoreError> {
        self.call(|reply| LedgerRequest::Report { date, reply }).await
    }

    pub async fn activity(&self) -> Result<Activity, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerRequest::Activity { reply: reply_tx })
            .await
            .map_err(|_| StoreError::Unavailable)?;
        reply_rx.await.map_err(|_| StoreError::Unavailable)
    }

    /// Zero the per-session commit counter. Fire-and-forget.
    pub async fn reset_session_count(&self) {
        if self.tx.send(LedgerRequest::ResetSessionCount).await.is_err() {
            tracing::warn!("ledger closed; session count not reset");
        }
    }

    pub async fn clear_attendance(&self) -> Result<usize, StoreError> {
        self.call(|reply| LedgerRequest::ClearAttendance { reply })
            .await
    }
}

/// Spawn the ledger on a dedicated OS thread. The thread exits when every
/// handle has been dropped.
pub fn spawn_ledger<S>(recorder: AttendanceRecorder<S>) -> std::io::Result<LedgerHandle>
where
    S: StudentDirectory + AttendanceStore + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<LedgerRequest>(32);

    std::thread::Builder::new()
        .name("rollcall-ledger".into())
        .spawn(move || {
            let mut recorder = recorder;
            tracing::info!("ledger thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut recorder, req);
            }
            tracing::info!("ledger thread exiting");
        })?;

    Ok(LedgerHandle { tx })
}

fn handle<S>(recorder: &mut AttendanceRecorder<S>, req: LedgerRequest)
where
    S: StudentDirectory + AttendanceStore,
{
    // A dropped reply receiver means the caller went away; nothing to do.
    match req {
        LedgerRequest::Commit {
            student_id,
            direction,
            now,
            reply,
        } => {
            let _ = reply.send(recorder.commit(student_id, direction, now));
        }
        LedgerRequest::Gallery { reply } => {
            let gallery = registered_faces(recorder.store()).map(|faces| {
                faces
                    .into_iter()
                    .map(|(student, embedding)| LabeledEmbedding::from_student(&student, embedding))
                    .collect()
            });
            let _ = reply.send(gallery);
        }
        LedgerRequest::RegisterFace {
            student_id,
            embedding,
            reply,
        } => {
            let _ = reply.send(register_face(recorder.store_mut(), student_id, embedding));
        }
        LedgerRequest::ClearFace { student_id, reply } => {
            let result = recorder
                .store_mut()
                .update_student(student_id, StudentPatch::clear_face());
            if result.is_ok() {
                tracing::info!(student_id, "face registration cleared");
            }
            let _ = reply.send(result);
        }
        LedgerRequest::GetStudent { student_id, reply } => {
            let _ = reply.send(recorder.store().get_student(student_id));
        }
        LedgerRequest::ListStudents { reply } => {
            let _ = reply.send(recorder.store().list_students());
        }
        LedgerRequest::AddStudent { student, reply } => {
            let result = recorder.store_mut().insert_student(student);
            if let Ok(s) = &result {
                tracing::info!(student_id = s.id, code = %s.code, "student added");
            }
            let _ = reply.send(result);
        }
        LedgerRequest::RemoveStudent { student_id, reply } => {
            let result = recorder.store_mut().remove_student(student_id);
            if let Ok(true) = result {
                tracing::info!(student_id, "student removed");
            }
            let _ = reply.send(result);
        }
        LedgerRequest::Report { date, reply } => {
            let _ = reply.send(build_report(recorder.store(), date));
        }
        LedgerRequest::Activity { reply } => {
            let _ = reply.send(Activity {
                session_count: recorder.session_count(),
                recent: recorder.feed().entries(),
            });
        }
        LedgerRequest::ResetSessionCount => recorder.reset_session_count(),
        LedgerRequest::ClearAttendance { reply } => {
            let result = recorder.store_mut().clear_records();
            if let Ok(n) = result {
                tracing::warn!(removed = n, "attendance records cleared");
            }
            let _ = reply.send(result);
        }
    }
}

fn build_report<S>(store: &S, date: NaiveDate) -> Result<Vec<ReportRow>, StoreError>
where
    S: StudentDirectory + AttendanceStore,
{
    store
        .records_for_date(date)?
        .into_iter()
        .map(|record| {
            let student = store
                .get_student(record.student_id)?
                .ok_or(StoreError::StudentNotFound(record.student_id))?;
            Ok(ReportRow {
                student_id: student.id,
                name: student.full_name(),
                code: student.code,
                check_in: record.check_in,
                check_out: record.check_out,
                status: record.status,
            })
        })
        .collect()
}
