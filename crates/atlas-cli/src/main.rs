use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "io.atlas.Attendance1",
    default_service = "io.atlas.Attendance1",
    default_path = "/io/atlas/Attendance1"
)]
trait Attendance {
    fn enroll(&self, identity_id: &str, pose: &str, image: Vec<u8>) -> zbus::Result<String>;
    fn process_capture(&self, image: Vec<u8>) -> zbus::Result<String>;
    fn remove_identity(&self, identity_id: &str) -> zbus::Result<u32>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn registered_students(&self) -> zbus::Result<String>;
    fn history(&self, date: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "atlas", about = "ATLAS face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student's face from an image
    Enroll {
        /// Student identifier (NISN)
        identity_id: String,
        /// Image containing exactly one face
        image: PathBuf,
        /// Pose label for this sample (e.g., "front", "left")
        #[arg(short, long, default_value = "")]
        pose: String,
    },
    /// Record attendance for every face in an image
    Capture {
        image: PathBuf,
    },
    /// Remove all enrolled faces of a student
    Remove {
        identity_id: String,
    },
    /// List enrolled student IDs
    List,
    /// List students with a registered face
    Registered,
    /// Show the attendance log for a day
    History {
        /// Day as YYYY-MM-DD (defaults to today)
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("atlasd is not reachable")?;

    match cli.command {
        Commands::Enroll {
            identity_id,
            image,
            pose,
        } => {
            let bytes = read_image(&image)?;
            tracing::debug!(identity_id = %identity_id, bytes = bytes.len(), "enrolling");
            print_json(&proxy.enroll(&identity_id, &pose, bytes).await?)?;
        }
        Commands::Capture { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.process_capture(bytes).await?)?;
        }
        Commands::Remove { identity_id } => {
            let removed = proxy.remove_identity(&identity_id).await?;
            println!("Removed {removed} face signature(s) for {identity_id}");
        }
        Commands::List => print_json(&proxy.list_identities().await?)?,
        Commands::Registered => print_json(&proxy.registered_students().await?)?,
        Commands::History { date } => print_json(&proxy.history(&date).await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// Re-indent a JSON reply from the daemon for the terminal.
fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
