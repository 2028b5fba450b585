use crate::config::Config;
use crate::engine::open_engine;
use crate::ledger::LedgerHandle;
use crate::workflow::{run_enrollment, run_recognition, EnrollmentCommand, EnrollmentSnapshot};
use chrono::{Local, NaiveDate};
use rollcall_core::attendance::ParseDirectionError;
use rollcall_core::{Direction, NewStudent, SessionSnapshot, StoreError, StudentId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use zbus::{fdo, interface};

/// The screen currently holding the camera.
enum ActiveScreen {
    Recognition {
        status: watch::Receiver<SessionSnapshot>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    Enrollment {
        status: watch::Receiver<EnrollmentSnapshot>,
        commands: mpsc::Sender<EnrollmentCommand>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
}

impl ActiveScreen {
    fn kind(&self) -> &'static str {
        match self {
            ActiveScreen::Recognition { .. } => "recognition",
            ActiveScreen::Enrollment { .. } => "enrollment",
        }
    }

    /// Signal the task and wait for it to finish, including any commit in
    /// flight.
    async fn shutdown(self) {
        let kind = self.kind();
        let (stop, task) = match self {
            ActiveScreen::Recognition { stop, task, .. } => (stop, task),
            ActiveScreen::Enrollment { stop, task, .. } => (stop, task),
        };
        let _ = stop.send(());
        if let Err(e) = task.await {
            tracing::error!(screen = kind, error = %e, "screen task ended abnormally");
        }
        tracing::info!(screen = kind, "screen stopped");
    }
}

#[derive(Serialize)]
struct DaemonStatus<'a> {
    version: &'static str,
    screen: &'a str,
    session_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enrollment: Option<EnrollmentSnapshot>,
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn store_error(e: StoreError) -> fdo::Error {
    match e {
        StoreError::StudentNotFound(_)
        | StoreError::RecordNotFound(_)
        | StoreError::DuplicateCode(_)
        | StoreError::DuplicateRecord { .. } => fdo::Error::InvalidArgs(e.to_string()),
        _ => fdo::Error::Failed(e.to_string()),
    }
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    config: Config,
    ledger: LedgerHandle,
    screen: Mutex<Option<ActiveScreen>>,
}

impl AttendanceService {
    pub fn new(config: Config, ledger: LedgerHandle) -> Self {
        Self {
            config,
            ledger,
            screen: Mutex::new(None),
        }
    }

    /// Stop whatever screen is active. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        if let Some(active) = self.screen.lock().await.take() {
            active.shutdown().await;
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a recognition session ("check-in" or "check-out"), replacing
    /// any active screen. Returns the initial session snapshot.
    async fn start_session(&self, direction: &str) -> fdo::Result<String> {
        let direction: Direction = direction
            .parse()
            .map_err(|e: ParseDirectionError| fdo::Error::InvalidArgs(e.to_string()))?;
        tracing::info!(direction = %direction, "start_session requested");

        let mut screen = self.screen.lock().await;
        if let Some(active) = screen.take() {
            active.shutdown().await;
        }

        let (status_tx, status) = watch::channel(SessionSnapshot::starting(direction));
        let (stop, stop_rx) = oneshot::channel();
        let config = self.config.clone();
        let task = tokio::spawn(run_recognition(
            direction,
            move || open_engine(&config),
            self.ledger.clone(),
            self.config.timings,
            self.config.distance_threshold,
            status_tx,
            stop_rx,
        ));
        let snapshot = status.borrow().clone();
        *screen = Some(ActiveScreen::Recognition { status, stop, task });
        to_json(&snapshot)
    }

    /// Stop the active screen. Returns false when nothing was running.
    async fn stop_session(&self) -> fdo::Result<bool> {
        let active = self.screen.lock().await.take();
        match active {
            Some(active) => {
                active.shutdown().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return daemon status, including the active screen's snapshot.
    async fn status(&self) -> fdo::Result<String> {
        let activity = self.ledger.activity().await.map_err(store_error)?;
        let screen = self.screen.lock().await;
        let (kind, session, enrollment) = match screen.as_ref() {
            Some(ActiveScreen::Recognition { status, .. }) => {
                ("recognition", Some(status.borrow().clone()), None)
            }
            Some(ActiveScreen::Enrollment { status, .. }) => {
                ("enrollment", None, Some(status.borrow().clone()))
            }
            None => ("idle", None, None),
        };
        to_json(&DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            screen: kind,
            session_count: activity.session_count,
            session,
            enrollment,
        })
    }

    /// Newest-first list of recent commits plus the session counter.
    async fn recent_activity(&self) -> fdo::Result<String> {
        let activity = self.ledger.activity().await.map_err(store_error)?;
        to_json(&activity)
    }

    /// Open the enrollment screen for a student, replacing any active screen.
    async fn begin_enrollment(&self, student_id: StudentId) -> fdo::Result<String> {
        tracing::info!(student_id, "begin_enrollment requested");
        if self.ledger.get_student(student_id).await.map_err(store_error)?.is_none() {
            return Err(fdo::Error::InvalidArgs(format!("student {student_id} not found")));
        }

        let mut screen = self.screen.lock().await;
        if let Some(active) = screen.take() {
            active.shutdown().await;
        }

        let (status_tx, status) = watch::channel(EnrollmentSnapshot::starting(student_id));
        let (commands, commands_rx) = mpsc::channel(4);
        let (stop, stop_rx) = oneshot::channel();
        let config = self.config.clone();
        let task = tokio::spawn(run_enrollment(
            student_id,
            move || open_engine(&config),
            self.ledger.clone(),
            self.config.timings.tick_interval,
            status_tx,
            commands_rx,
            stop_rx,
        ));
        let snapshot = status.borrow().clone();
        *screen = Some(ActiveScreen::Enrollment {
            status,
            commands,
            stop,
            task,
        });
        to_json(&snapshot)
    }

    async fn enrollment_status(&self) -> fdo::Result<String> {
        let screen = self.screen.lock().await;
        match screen.as_ref() {
            Some(ActiveScreen::Enrollment { status, .. }) => to_json(&*status.borrow()),
            _ => Err(fdo::Error::Failed("no enrollment in progress".into())),
        }
    }

    /// Store the held face as the enrolling student's descriptor.
    async fn capture(&self) -> fdo::Result<String> {
        let commands = match self.screen.lock().await.as_ref() {
            Some(ActiveScreen::Enrollment { commands, .. }) => commands.clone(),
            _ => return Err(fdo::Error::Failed("no enrollment in progress".into())),
        };
        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(EnrollmentCommand::Capture { reply })
            .await
            .map_err(|_| fdo::Error::Failed("enrollment ended".into()))?;
        let student = reply_rx
            .await
            .map_err(|_| fdo::Error::Failed("enrollment ended".into()))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        to_json(&student)
    }

    /// Close the enrollment screen. Returns false when none was open.
    async fn end_enrollment(&self) -> fdo::Result<bool> {
        let mut screen = self.screen.lock().await;
        if !matches!(screen.as_ref(), Some(ActiveScreen::Enrollment { .. })) {
            return Ok(false);
        }
        if let Some(active) = screen.take() {
            active.shutdown().await;
        }
        Ok(true)
    }

    async fn list_students(&self) -> fdo::Result<String> {
        let students = self.ledger.list_students().await.map_err(store_error)?;
        to_json(&students)
    }

    /// Add a student from a JSON object with `code`, `first_name`,
    /// `last_name` and optional `class_level`, `room`, `status`.
    async fn add_student(&self, student: &str) -> fdo::Result<String> {
        let new: NewStudent = serde_json::from_str(student)
            .map_err(|e| fdo::Error::InvalidArgs(format!("invalid student: {e}")))?;
        let student = self.ledger.add_student(new).await.map_err(store_error)?;
        to_json(&student)
    }

    /// Remove a student and their attendance records.
    async fn remove_student(&self, student_id: StudentId) -> fdo::Result<bool> {
        self.ledger.remove_student(student_id).await.map_err(store_error)
    }

    async fn clear_face(&self, student_id: StudentId) -> fdo::Result<String> {
        let student = self.ledger.clear_face(student_id).await.map_err(store_error)?;
        to_json(&student)
    }

    /// Attendance for a date (`YYYY-MM-DD`; empty means today).
    async fn report(&self, date: &str) -> fdo::Result<String> {
        let date = if date.is_empty() {
            Local::now().date_naive()
        } else {
            NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}")))?
        };
        let rows = self.ledger.report(date).await.map_err(store_error)?;
        to_json(&rows)
    }

    /// Delete every attendance record. Returns how many were removed.
    async fn clear_attendance(&self) -> fdo::Result<u64> {
        let removed = self.ledger.clear_attendance().await.map_err(store_error)?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::spawn_ledger;
    use rollcall_core::recorder::DEFAULT_FEED_LEN;
    use rollcall_core::{AttendanceRecorder, MemoryStore, Settings};

    fn service() -> AttendanceService {
        let mut config = Config::from_env();
        config.camera_device = "/dev/rollcall-test-missing".into();
        let recorder = AttendanceRecorder::new(MemoryStore::new(), Settings::default(), DEFAULT_FEED_LEN);
        AttendanceService::new(config, spawn_ledger(recorder).unwrap())
    }

    #[tokio::test]
    async fn test_roster_round_trip() {
        let svc = service();
        let added = svc
            .add_student(r#"{"code":"S-1","first_name":"Ada","last_name":"Test"}"#)
            .await
            .unwrap();
        let added: serde_json::Value = serde_json::from_str(&added).unwrap();
        let id = added["id"].as_i64().unwrap();

        let list: serde_json::Value =
            serde_json::from_str(&svc.list_students().await.unwrap()).unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);

        assert!(svc.remove_student(id).await.unwrap());
        assert!(!svc.remove_student(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let svc = service();
        assert!(matches!(svc.start_session("sideways").await, Err(fdo::Error::InvalidArgs(_))));
        assert!(matches!(svc.add_student("{}").await, Err(fdo::Error::InvalidArgs(_))));
        assert!(matches!(svc.report("06/05/2024").await, Err(fdo::Error::InvalidArgs(_))));
        assert!(matches!(svc.begin_enrollment(7).await, Err(fdo::Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_missing_camera_surfaces_in_status() {
        let svc = service();
        svc.start_session("check-in").await.unwrap();

        let mut status = String::new();
        for _ in 0..100 {
            status = svc.status().await.unwrap();
            if status.contains("no camera found") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let status: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status["screen"], "recognition");
        assert_eq!(status["session"]["phase"], "error");

        assert!(svc.stop_session().await.unwrap());
        assert!(!svc.stop_session().await.unwrap());
    }

    #[tokio::test]
    async fn test_enrollment_calls_need_an_enrollment() {
        let svc = service();
        assert!(svc.enrollment_status().await.is_err());
        assert!(svc.capture().await.is_err());
        assert!(!svc.end_enrollment().await.unwrap());
    }

    #[tokio::test]
    async fn test_report_defaults_to_today() {
        let svc = service();
        assert_eq!(svc.report("").await.unwrap(), "[]");
        assert_eq!(svc.clear_attendance().await.unwrap(), 0);
    }
}
