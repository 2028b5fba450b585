use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use zbus::proxy;

#[proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_session(&self, direction: &str) -> zbus::Result<String>;
    fn stop_session(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn recent_activity(&self) -> zbus::Result<String>;
    fn begin_enrollment(&self, student_id: i64) -> zbus::Result<String>;
    fn enrollment_status(&self) -> zbus::Result<String>;
    fn capture(&self) -> zbus::Result<String>;
    fn end_enrollment(&self) -> zbus::Result<bool>;
    fn list_students(&self) -> zbus::Result<String>;
    fn add_student(&self, student: &str) -> zbus::Result<String>;
    fn remove_student(&self, student_id: i64) -> zbus::Result<bool>;
    fn clear_face(&self, student_id: i64) -> zbus::Result<String>;
    fn report(&self, date: &str) -> zbus::Result<String>;
    fn clear_attendance(&self) -> zbus::Result<u64>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-match attendance station CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a check-in session
    CheckIn,
    /// Start a check-out session
    CheckOut,
    /// Stop the active session or enrollment
    Stop,
    /// Show daemon and session status
    Status,
    /// Show recent check-ins and check-outs
    Activity,
    /// Open the enrollment screen for a student
    Enroll {
        /// Student ID
        id: i64,
    },
    /// Show enrollment guidance
    EnrollStatus,
    /// Capture the current face for the enrolling student
    Capture,
    /// Close the enrollment screen
    EnrollCancel,
    /// Manage the student roster
    Students {
        #[command(subcommand)]
        command: StudentCommands,
    },
    /// Show attendance for a date (default: today)
    Report {
        /// Date as YYYY-MM-DD
        date: Option<String>,
    },
    /// Delete every attendance record
    ClearAttendance {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
}

#[derive(Subcommand)]
enum StudentCommands {
    /// List students
    List,
    /// Add a student
    Add {
        /// Student code (e.g. "S-2024-017")
        #[arg(long)]
        code: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "")]
        class_level: String,
        #[arg(long, default_value = "")]
        room: String,
    },
    /// Remove a student and their attendance records
    Remove { id: i64 },
    /// Clear a student's registered face
    ClearFace { id: i64 },
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    tracing::debug!(system, "connected to bus");
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable; is the daemon running?")
}

fn parse(reply: &str) -> Result<Value> {
    serde_json::from_str(reply).context("daemon sent malformed JSON")
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("-")
}

fn print_session(session: &Value) {
    println!("direction: {}", text(&session["direction"]));
    println!("phase:     {}", text(&session["phase"]));
    println!("message:   {}", text(&session["message"]));
    println!("enrolled:  {}", session["enrolled"]);
    if let Some(c) = session.get("candidate").filter(|c| !c.is_null()) {
        println!("candidate: {} ({}%)", text(&c["name"]), c["confidence"]);
    }
    if let Some(faces) = session["overlay"].as_array() {
        for face in faces {
            let label = face["label"].as_str().unwrap_or("unknown");
            let b = &face["bbox"];
            println!(
                "  face at ({:.0}, {:.0}) {:.0}x{:.0}: {label}",
                b["x"].as_f64().unwrap_or(0.0),
                b["y"].as_f64().unwrap_or(0.0),
                b["width"].as_f64().unwrap_or(0.0),
                b["height"].as_f64().unwrap_or(0.0),
            );
        }
    }
}

fn print_enrollment(enrollment: &Value) {
    let name = enrollment["student_name"].as_str().unwrap_or("?");
    println!("student:   {} ({name})", enrollment["student_id"]);
    println!("message:   {}", text(&enrollment["message"]));
    if let Some(ratio) = enrollment["verdict"]["ratio"].as_f64() {
        println!("face size: {:.1}% of frame", ratio * 100.0);
    }
    println!("capture:   {}", if enrollment["capture_enabled"] == true { "ready" } else { "not ready" });
    println!("registered: {}", enrollment["registered"]);
}

fn print_activity(activity: &Value) {
    println!("this session: {}", activity["session_count"]);
    match activity["recent"].as_array() {
        Some(recent) if !recent.is_empty() => {
            for entry in recent {
                let verb = if entry["direction"] == "check-in" { "in " } else { "out" };
                println!(
                    "  {} {verb} {:<24} {}",
                    text(&entry["time"]),
                    text(&entry["student_name"]),
                    text(&entry["status"]),
                );
            }
        }
        _ => println!("  no activity yet"),
    }
}

fn print_students(students: &Value) {
    let Some(students) = students.as_array().filter(|s| !s.is_empty()) else {
        println!("No students");
        return;
    };
    println!("{:<5} {:<14} {:<28} {:<8} {:<6} {:<10} FACE", "ID", "CODE", "NAME", "CLASS", "ROOM", "STATUS");
    for s in students {
        let name = format!("{} {}", text(&s["first_name"]), text(&s["last_name"]));
        let face = if s.get("face_descriptor").is_some_and(|d| !d.is_null()) { "yes" } else { "no" };
        println!(
            "{:<5} {:<14} {:<28} {:<8} {:<6} {:<10} {face}",
            s["id"].to_string(),
            text(&s["code"]),
            name,
            text(&s["class_level"]),
            text(&s["room"]),
            text(&s["status"]),
        );
    }
}

fn print_report(date: &str, rows: &Value) {
    let Some(rows) = rows.as_array().filter(|r| !r.is_empty()) else {
        println!("No attendance recorded{}", if date.is_empty() { " today".to_string() } else { format!(" on {date}") });
        return;
    };
    println!("{:<14} {:<28} {:<6} {:<6} STATUS", "CODE", "NAME", "IN", "OUT");
    for r in rows {
        println!(
            "{:<14} {:<28} {:<6} {:<6} {}",
            text(&r["code"]),
            text(&r["name"]),
            text(&r["check_in"]),
            text(&r["check_out"]),
            text(&r["status"]),
        );
    }
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} (driver: {}, bus: {})", d.path, d.name, d.driver, d.bus);
    }
}

async fn start(proxy: &AttendanceProxy<'_>, direction: &str) -> Result<()> {
    let session = parse(&proxy.start_session(direction).await?)?;
    println!("Started {direction} session; run `rollcall status` to follow it");
    print_session(&session);
    Ok(())
}

async fn run(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::CheckIn => start(proxy, "check-in").await?,
        Commands::CheckOut => start(proxy, "check-out").await?,
        Commands::Stop => {
            if proxy.stop_session().await? {
                println!("Stopped");
            } else {
                println!("Nothing was running");
            }
        }
        Commands::Status => {
            let status = parse(&proxy.status().await?)?;
            println!("rollcalld {}", text(&status["version"]));
            println!("screen:    {}", text(&status["screen"]));
            println!("session count: {}", status["session_count"]);
            if let Some(session) = status.get("session") {
                print_session(session);
            }
            if let Some(enrollment) = status.get("enrollment") {
                print_enrollment(enrollment);
            }
        }
        Commands::Activity => {
            print_activity(&parse(&proxy.recent_activity().await?)?);
        }
        Commands::Enroll { id } => {
            let enrollment = parse(&proxy.begin_enrollment(id).await?)?;
            println!("Enrollment open; position the student, then run `rollcall capture`");
            print_enrollment(&enrollment);
        }
        Commands::EnrollStatus => {
            print_enrollment(&parse(&proxy.enrollment_status().await?)?);
        }
        Commands::Capture => {
            let student = parse(&proxy.capture().await?)?;
            println!(
                "Face registered for {} {} ({})",
                text(&student["first_name"]),
                text(&student["last_name"]),
                text(&student["code"]),
            );
        }
        Commands::EnrollCancel => {
            if proxy.end_enrollment().await? {
                println!("Enrollment closed");
            } else {
                println!("No enrollment in progress");
            }
        }
        Commands::Students { command } => match command {
            StudentCommands::List => print_students(&parse(&proxy.list_students().await?)?),
            StudentCommands::Add {
                code,
                first_name,
                last_name,
                class_level,
                room,
            } => {
                let body = json!({
                    "code": code,
                    "first_name": first_name,
                    "last_name": last_name,
                    "class_level": class_level,
                    "room": room,
                });
                let student = parse(&proxy.add_student(&body.to_string()).await?)?;
                println!("Added student {} with ID {}", text(&student["code"]), student["id"]);
            }
            StudentCommands::Remove { id } => {
                if proxy.remove_student(id).await? {
                    println!("Removed student {id}");
                } else {
                    println!("No student with ID {id}");
                }
            }
            StudentCommands::ClearFace { id } => {
                proxy.clear_face(id).await?;
                println!("Cleared face registration for student {id}");
            }
        },
        Commands::Report { date } => {
            let date = date.unwrap_or_default();
            if !date.is_empty() {
                NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .with_context(|| format!("invalid date {date:?}; expected YYYY-MM-DD"))?;
            }
            print_report(&date, &parse(&proxy.report(&date).await?)?);
        }
        Commands::ClearAttendance { yes } => {
            if !yes {
                anyhow::bail!("this deletes every attendance record; pass --yes to confirm");
            }
            let removed = proxy.clear_attendance().await?;
            println!("Removed {removed} attendance records");
        }
        Commands::Devices => list_devices(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Device listing talks to V4L2 directly, no daemon needed.
    if let Commands::Devices = cli.command {
        list_devices();
        return Ok(());
    }

    let system = cli.system || std::env::var("ROLLCALL_BUS").is_ok_and(|v| v == "system");
    let proxy = connect(system).await?;
    run(&proxy, cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_students_add() {
        let cli = Cli::try_parse_from([
            "rollcall", "students", "add", "--code", "S-1", "--first-name", "Ada", "--last-name", "Test",
        ])
        .unwrap();
        match cli.command {
            Commands::Students { command: StudentCommands::Add { code, room, .. } } => {
                assert_eq!(code, "S-1");
                assert_eq!(room, "");
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_parse_report_optional_date() {
        let cli = Cli::try_parse_from(["rollcall", "report"]).unwrap();
        assert!(matches!(cli.command, Commands::Report { date: None }));
        let cli = Cli::try_parse_from(["rollcall", "report", "2024-05-06"]).unwrap();
        assert!(matches!(cli.command, Commands::Report { date: Some(_) }));
    }

    #[test]
    fn test_parse_kebab_commands() {
        for args in [
            ["rollcall", "check-in"],
            ["rollcall", "check-out"],
            ["rollcall", "enroll-status"],
            ["rollcall", "enroll-cancel"],
        ] {
            assert!(Cli::try_parse_from(args).is_ok(), "{args:?}");
        }
    }
}
