//! Recognition and enrollment tasks.
//!
//! Each active screen is one tokio task. It owns the engine handle, samples
//! on a fixed tick and publishes its state through a `watch` channel. The
//! task ends when its stop signal fires; dropping the engine handle then
//! releases the camera.

use crate::engine::{EngineError, EngineHandle};
use crate::ledger::LedgerHandle;
use chrono::Local;
use rollcall_core::{
    CaptureError, Direction, FaceMatcher, GateVerdict, RecognitionSession, RegistrationGate,
    SessionSnapshot, Student, StudentId, WorkflowTimings,
};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Run the engine opener on the blocking pool; camera and model errors come
/// back as operator-facing text.
async fn start_engine<F>(open: F) -> Result<EngineHandle, String>
where
    F: FnOnce() -> Result<EngineHandle, EngineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(open).await {
        Ok(Ok(engine)) => Ok(engine),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => {
            tracing::error!(error = %e, "engine startup task failed");
            Err("camera engine failed to start".into())
        }
    }
}

/// Await `fut` unless `stop` fires first.
async fn unless_stopped<T>(stop: &mut oneshot::Receiver<()>, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = stop => None,
        out = fut => Some(out),
    }
}

/// True once the stop signal has fired or its sender is gone.
fn stop_requested(stop: &mut oneshot::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Drive one check-in or check-out session until `stop` fires.
pub async fn run_recognition<F>(
    direction: Direction,
    open: F,
    ledger: LedgerHandle,
    timings: WorkflowTimings,
    distance_threshold: f32,
    status: watch::Sender<SessionSnapshot>,
    mut stop: oneshot::Receiver<()>,
) where
    F: FnOnce() -> Result<EngineHandle, EngineError> + Send + 'static,
{
    ledger.reset_session_count().await;

    let Some(gallery) = unless_stopped(&mut stop, ledger.gallery()).await else {
        return;
    };
    let gallery = match gallery {
        Ok(gallery) => gallery,
        Err(e) => {
            status.send_replace(SessionSnapshot::failed(direction, format!("roster unavailable: {e}")));
            let _ = stop.await;
            return;
        }
    };
    let matcher = FaceMatcher::build(gallery, distance_threshold);
    if matcher.is_empty() {
        tracing::warn!(direction = %direction, "no registered faces; every face will be unknown");
    }

    let Some(engine) = unless_stopped(&mut stop, start_engine(open)).await else {
        tracing::info!(direction = %direction, "session stopped during startup");
        return;
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(message) => {
            tracing::error!(direction = %direction, message = %message, "session failed to start");
            status.send_replace(SessionSnapshot::failed(direction, message));
            let _ = stop.await;
            return;
        }
    };

    let mut session = RecognitionSession::new(direction, matcher, timings);
    status.send_replace(session.snapshot());
    tracing::info!(direction = %direction, enrolled = session.snapshot().enrolled, "session started");

    let mut tick = ticker(timings.tick_interval);
    loop {
        let deadline = session.next_deadline().map(Instant::from_std);
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = tick.tick() => {
                if session.begin_detection() {
                    let Some(detected) = unless_stopped(&mut stop, engine.detect()).await else {
                        break;
                    };
                    match detected {
                        Ok(frame) => {
                            session.on_detections(now(), &frame.detections);
                        }
                        Err(EngineError::ChannelClosed) => {
                            session.fail("camera engine stopped unexpectedly");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "detection failed; skipping frame");
                            session.abort_detection();
                        }
                    }
                }
            }
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
        }

        // A pending commit is cancelled by a stop that landed after the wake-up.
        if stop_requested(&mut stop) {
            break;
        }
        if let Some(request) = session.poll(now()) {
            status.send_replace(session.snapshot());
            let result = ledger
                .commit(request.student_id, request.direction, Local::now().naive_local())
                .await;
            session.on_commit_result(now(), &result);
        }
        status.send_replace(session.snapshot());

        if session.is_failed() {
            let _ = (&mut stop).await;
            break;
        }
    }

    tracing::info!(direction = %direction, "session stopped");
}

/// Point-in-time view of an enrollment screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentSnapshot {
    pub student_id: StudentId,
    pub student_name: Option<String>,
    pub verdict: Option<GateVerdict>,
    pub message: String,
    pub capture_enabled: bool,
    pub registered: bool,
    pub failed: bool,
}

impl EnrollmentSnapshot {
    pub fn starting(student_id: StudentId) -> Self {
        Self {
            student_id,
            student_name: None,
            verdict: None,
            message: "starting camera".into(),
            capture_enabled: false,
            registered: false,
            failed: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.failed = true;
        self.capture_enabled = false;
    }
}

/// Operator commands for a running enrollment.
pub enum EnrollmentCommand {
    Capture {
        reply: oneshot::Sender<Result<Student, CaptureError>>,
    },
}

/// Drive one enrollment screen until `stop` fires or the command channel
/// closes.
pub async fn run_enrollment<F>(
    student_id: StudentId,
    open: F,
    ledger: LedgerHandle,
    tick_interval: Duration,
    status: watch::Sender<EnrollmentSnapshot>,
    mut commands: mpsc::Receiver<EnrollmentCommand>,
    mut stop: oneshot::Receiver<()>,
) where
    F: FnOnce() -> Result<EngineHandle, EngineError> + Send + 'static,
{
    let mut snapshot = EnrollmentSnapshot::starting(student_id);

    let Some(student) = unless_stopped(&mut stop, ledger.get_student(student_id)).await else {
        return;
    };
    let student = match student {
        Ok(Some(student)) => student,
        Ok(None) => {
            snapshot.fail(CaptureError::UnknownStudent(student_id).to_string());
            status.send_replace(snapshot);
            let _ = stop.await;
            return;
        }
        Err(e) => {
            snapshot.fail(format!("roster unavailable: {e}"));
            status.send_replace(snapshot);
            let _ = stop.await;
            return;
        }
    };
    snapshot.student_name = Some(student.full_name());
    snapshot.registered = student.face_registered();

    let Some(engine) = unless_stopped(&mut stop, start_engine(open)).await else {
        tracing::info!(student_id, "enrollment stopped during startup");
        return;
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(message) => {
            tracing::error!(student_id, message = %message, "enrollment failed to start");
            snapshot.fail(message);
            status.send_replace(snapshot);
            let _ = stop.await;
            return;
        }
    };
    snapshot.message = GateVerdict::NoFace.message();
    status.send_replace(snapshot.clone());
    tracing::info!(student_id, "enrollment started");

    let mut gate = RegistrationGate::new();
    let mut tick = ticker(tick_interval);
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            command = commands.recv() => {
                let Some(EnrollmentCommand::Capture { reply }) = command else {
                    break;
                };
                let result = match gate.take() {
                    Ok(embedding) => ledger.register_face(student_id, embedding).await,
                    Err(e) => Err(e),
                };
                match &result {
                    Ok(student) => {
                        snapshot.registered = true;
                        snapshot.verdict = None;
                        snapshot.message = format!("face registered for {}", student.full_name());
                    }
                    Err(e) => {
                        tracing::info!(student_id, error = %e, "capture rejected");
                        snapshot.message = e.to_string();
                    }
                }
                snapshot.capture_enabled = gate.capture_enabled();
                let _ = reply.send(result);
            }
            _ = tick.tick() => {
                let Some(detected) = unless_stopped(&mut stop, engine.detect()).await else {
                    break;
                };
                match detected {
                    Ok(frame) => {
                        let verdict = gate.observe(&frame.detections, frame.width, frame.height);
                        snapshot.verdict = Some(verdict);
                        snapshot.message = verdict.message();
                        snapshot.capture_enabled = gate.capture_enabled();
                    }
                    Err(EngineError::ChannelClosed) => {
                        gate.reset();
                        snapshot.fail("camera engine stopped unexpectedly");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "detection failed; skipping frame");
                    }
                }
            }
        }
        status.send_replace(snapshot.clone());

        if snapshot.failed {
            let _ = (&mut stop).await;
            break;
        }
    }

    tracing::info!(student_id, "enrollment stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine, ScriptedDetector, Step};
    use crate::ledger::spawn_ledger;
    use rollcall_core::recorder::DEFAULT_FEED_LEN;
    use rollcall_core::session::PhaseKind;
    use rollcall_core::{
        AttendanceRecorder, BoundingBox, Detection, Embedding, MemoryStore, NewStudent, Settings,
        StudentStatus,
    };
    use rollcall_hw::CameraError;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn timings() -> WorkflowTimings {
        WorkflowTimings {
            tick_interval: Duration::from_millis(10),
            cooldown: Duration::from_secs(60),
            commit_delay: Duration::from_millis(20),
            settle_delay: Duration::from_millis(30),
        }
    }

    /// A face covering `side * side` of the 100x100 test frame.
    fn face(side: f32, values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: side, height: side, confidence: 0.9 },
            embedding: Embedding::new(values),
        }
    }

    fn ada_face() -> Detection {
        face(30.0, vec![1.0, 0.0])
    }

    async fn ledger_with_ada(registered: bool) -> (LedgerHandle, StudentId) {
        let recorder = AttendanceRecorder::new(MemoryStore::new(), Settings::default(), DEFAULT_FEED_LEN);
        let ledger = spawn_ledger(recorder).unwrap();
        let ada = ledger
            .add_student(NewStudent {
                code: "S-1".into(),
                first_name: "Ada".into(),
                last_name: "Test".into(),
                class_level: String::new(),
                room: String::new(),
                status: StudentStatus::Active,
            })
            .await
            .unwrap();
        if registered {
            ledger.register_face(ada.id, Embedding::new(vec![1.0, 0.0])).await.unwrap();
        }
        (ledger, ada.id)
    }

    struct Screen<T> {
        status: watch::Receiver<T>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    }

    impl<T> Screen<T> {
        async fn stop(self) {
            let _ = self.stop.send(());
            time::timeout(WAIT, self.task).await.unwrap().unwrap();
        }
    }

    fn recognition<F>(direction: Direction, open: F, ledger: LedgerHandle) -> Screen<SessionSnapshot>
    where
        F: FnOnce() -> Result<EngineHandle, EngineError> + Send + 'static,
    {
        let (status_tx, status) = watch::channel(SessionSnapshot::starting(direction));
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_recognition(
            direction, open, ledger, timings(), 0.5, status_tx, stop_rx,
        ));
        Screen { status, stop, task }
    }

    async fn wait_for_message(status: &mut watch::Receiver<SessionSnapshot>, needle: &str) -> SessionSnapshot {
        time::timeout(WAIT, status.wait_for(|s| s.message.contains(needle)))
            .await
            .unwrap()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_recognized_student_checks_in_once() {
        let (ledger, ada) = ledger_with_ada(true).await;
        let detector = ScriptedDetector::constant(vec![ada_face()]);
        let mut screen = recognition(Direction::CheckIn, move || Ok(engine(detector)), ledger.clone());

        let snap = wait_for_message(&mut screen.status, "Ada Test checked in at").await;
        assert_eq!(snap.phase, PhaseKind::Settling);
        time::timeout(WAIT, screen.status.wait_for(|s| s.phase == PhaseKind::Ready))
            .await
            .unwrap()
            .unwrap();

        // Face still in view, but the cooldown holds.
        time::sleep(Duration::from_millis(150)).await;
        let activity = ledger.activity().await.unwrap();
        assert_eq!(activity.session_count, 1);
        assert_eq!(activity.recent[0].student_id, ada);

        screen.stop().await;
    }

    #[tokio::test]
    async fn test_repeat_check_in_shows_rejection() {
        let (ledger, ada) = ledger_with_ada(true).await;
        ledger
            .commit(ada, Direction::CheckIn, Local::now().naive_local())
            .await
            .unwrap();

        let detector = ScriptedDetector::constant(vec![ada_face()]);
        let mut screen = recognition(Direction::CheckIn, move || Ok(engine(detector)), ledger.clone());
        let snap = wait_for_message(&mut screen.status, "Ada Test: already checked in at").await;
        assert_eq!(snap.phase, PhaseKind::Settling);
        screen.stop().await;

        // Starting the session reset the counter; the rejection did not count.
        assert_eq!(ledger.activity().await.unwrap().session_count, 0);
    }

    #[tokio::test]
    async fn test_check_out_without_check_in() {
        let (ledger, _) = ledger_with_ada(true).await;
        let detector = ScriptedDetector::constant(vec![ada_face()]);
        let mut screen = recognition(Direction::CheckOut, move || Ok(engine(detector)), ledger);
        wait_for_message(&mut screen.status, "no check-in found for today").await;
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_detection_failures_do_not_stop_session() {
        let (ledger, _) = ledger_with_ada(true).await;
        let detector = ScriptedDetector::new(vec![Step::Fail, Step::Panic, Step::Fail], vec![ada_face()]);
        let mut screen = recognition(Direction::CheckIn, move || Ok(engine(detector)), ledger);
        wait_for_message(&mut screen.status, "checked in at").await;
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_face_never_commits() {
        let (ledger, _) = ledger_with_ada(true).await;
        let detector = ScriptedDetector::constant(vec![face(30.0, vec![0.0, 1.0])]);
        let mut screen = recognition(Direction::CheckIn, move || Ok(engine(detector)), ledger.clone());
        let snap = wait_for_message(&mut screen.status, "face not recognized").await;
        assert_eq!(snap.overlay.len(), 1);
        assert!(snap.overlay[0].student_id.is_none());

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ledger.activity().await.unwrap().session_count, 0);
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_camera_failure_is_terminal() {
        let (ledger, _) = ledger_with_ada(true).await;
        let mut screen = recognition(
            Direction::CheckIn,
            || Err(EngineError::Camera(CameraError::PermissionDenied("/dev/video0".into()))),
            ledger,
        );
        let snap = time::timeout(WAIT, screen.status.wait_for(|s| s.message.contains("denied")))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(snap.phase, PhaseKind::Error);
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_commit_during_slow_detection() {
        let (ledger, ada) = ledger_with_ada(true).await;
        let detector = ScriptedDetector::constant(vec![ada_face()]).with_delay(Duration::from_millis(150));
        let (status_tx, mut status) = watch::channel(SessionSnapshot::starting(Direction::CheckIn));
        let (stop, stop_rx) = oneshot::channel();
        let slow = WorkflowTimings {
            commit_delay: Duration::from_millis(60),
            ..timings()
        };
        let task = tokio::spawn(run_recognition(
            Direction::CheckIn,
            move || Ok(engine(detector)),
            ledger.clone(),
            slow,
            0.5,
            status_tx,
            stop_rx,
        ));

        time::timeout(WAIT, status.wait_for(|s| s.phase == PhaseKind::PendingCommit))
            .await
            .unwrap()
            .unwrap();
        // Leave before the commit is due, while the next frame is still in the detector.
        time::sleep(Duration::from_millis(20)).await;
        stop.send(()).unwrap();
        time::timeout(WAIT, task).await.unwrap().unwrap();

        let activity = ledger.activity().await.unwrap();
        assert_eq!(activity.session_count, 0);
        assert!(activity.recent.is_empty());
        let today = Local::now().date_naive();
        let report = ledger.report(today).await.unwrap();
        assert!(report.iter().all(|row| row.student_id != ada));
    }

    #[tokio::test]
    async fn test_stop_during_startup_does_not_wait_for_camera() {
        let (ledger, _) = ledger_with_ada(true).await;
        let screen = recognition(
            Direction::CheckIn,
            || {
                std::thread::sleep(Duration::from_millis(800));
                Ok(engine(ScriptedDetector::constant(Vec::new())))
            },
            ledger,
        );

        time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        let _ = screen.stop.send(());
        time::timeout(Duration::from_millis(400), screen.task)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    fn enrollment<F>(
        student_id: StudentId,
        open: F,
        ledger: LedgerHandle,
    ) -> (Screen<EnrollmentSnapshot>, mpsc::Sender<EnrollmentCommand>)
    where
        F: FnOnce() -> Result<EngineHandle, EngineError> + Send + 'static,
    {
        let (status_tx, status) = watch::channel(EnrollmentSnapshot::starting(student_id));
        let (commands, commands_rx) = mpsc::channel(4);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_enrollment(
            student_id,
            open,
            ledger,
            Duration::from_millis(10),
            status_tx,
            commands_rx,
            stop_rx,
        ));
        (Screen { status, stop, task }, commands)
    }

    async fn capture(commands: &mpsc::Sender<EnrollmentCommand>) -> Result<Student, CaptureError> {
        let (reply, rx) = oneshot::channel();
        commands.send(EnrollmentCommand::Capture { reply }).await.unwrap();
        time::timeout(WAIT, rx).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_enrollment_guides_then_captures() {
        let (ledger, ada) = ledger_with_ada(false).await;
        // Too close for a few frames, then a good distance.
        let too_large = face(70.0, vec![1.0, 0.0]);
        let detector = ScriptedDetector::new(
            vec![
                Step::Faces(vec![too_large.clone()]),
                Step::Faces(vec![too_large.clone()]),
                Step::Faces(vec![too_large]),
            ],
            vec![ada_face()],
        );
        let (mut screen, commands) = enrollment(ada, move || Ok(engine(detector)), ledger.clone());

        time::timeout(WAIT, screen.status.wait_for(|s| s.capture_enabled))
            .await
            .unwrap()
            .unwrap();

        let student = capture(&commands).await.unwrap();
        assert!(student.face_registered());
        assert_eq!(ledger.gallery().await.unwrap().len(), 1);

        time::timeout(WAIT, screen.status.wait_for(|s| s.registered))
            .await
            .unwrap()
            .unwrap();
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_capture_refused_without_qualifying_face() {
        let (ledger, ada) = ledger_with_ada(false).await;
        let detector = ScriptedDetector::constant(vec![ada_face(), face(20.0, vec![0.0, 1.0])]);
        let (mut screen, commands) = enrollment(ada, move || Ok(engine(detector)), ledger.clone());

        let snap = time::timeout(WAIT, screen.status.wait_for(|s| s.verdict.is_some()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(snap.verdict, Some(GateVerdict::MultipleFaces { count: 2 }));

        assert_eq!(capture(&commands).await.unwrap_err(), CaptureError::NotReady);
        assert!(ledger.gallery().await.unwrap().is_empty());
        screen.stop().await;
    }

    #[tokio::test]
    async fn test_enrollment_unknown_student() {
        let (ledger, _) = ledger_with_ada(false).await;
        let (mut screen, _commands) = enrollment(
            99,
            || Ok(engine(ScriptedDetector::constant(Vec::new()))),
            ledger,
        );
        let snap = time::timeout(WAIT, screen.status.wait_for(|s| s.failed))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(snap.message, "student 99 is not in the directory");
        screen.stop().await;
    }
}
