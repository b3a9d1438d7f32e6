use crate::engine::{EngineError, EngineHandle};
use atlas_core::{AttendanceError, AttendanceService};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "io.atlas.Attendance1";
pub const OBJECT_PATH: &str = "/io/atlas/Attendance1";

/// D-Bus interface for the ATLAS attendance daemon.
///
/// Bus name: io.atlas.Attendance1
/// Object path: /io/atlas/Attendance1
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
    engine: EngineHandle,
    /// Daemon runtime; zbus dispatches methods on its own executor.
    runtime: Handle,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>, engine: EngineHandle, runtime: Handle) -> Self {
        Self {
            service,
            engine,
            runtime,
        }
    }
}

#[interface(name = "io.atlas.Attendance1")]
impl AttendanceInterface {
    /// Enroll the single face in `image` for a student. Returns the new signature as JSON.
    async fn enroll(&self, identity_id: &str, pose: &str, image: Vec<u8>) -> fdo::Result<String> {
        let identity_id = identity_id.trim().to_string();
        let pose = Some(pose.trim().to_string()).filter(|p| !p.is_empty());
        tracing::info!(identity_id = %identity_id, pose = ?pose, bytes = image.len(), "enroll requested");

        let detected = self.engine.detect(image).await.map_err(engine_error)?;
        let service = Arc::clone(&self.service);
        let enrolled = unblock(&self.runtime, move || {
            service.enroll(&identity_id, pose.as_deref(), detected, Local::now().naive_local())
        })
        .await?
        .map_err(service_error)?;

        to_json(&serde_json::json!({
            "status": "success",
            "signature_id": enrolled.signature_id,
            "identity_id": enrolled.identity_id,
            "pose": enrolled.pose,
        }))
    }

    /// Match every face in `image` and record attendance. Returns the capture report as JSON.
    async fn process_capture(&self, image: Vec<u8>) -> fdo::Result<String> {
        let detected = self.engine.detect(image).await.map_err(engine_error)?;
        tracing::debug!(faces = detected.len(), "capture received");

        let service = Arc::clone(&self.service);
        let report = unblock(&self.runtime, move || {
            service.process_capture(&detected, Local::now().naive_local())
        })
        .await?;
        tracing::info!(
            detected = report.all_detected.len(),
            recorded = report.new_entries.len(),
            "capture processed"
        );
        to_json(&report)
    }

    /// Remove a student's enrolled faces. Returns the number of signatures removed.
    async fn remove_identity(&self, identity_id: &str) -> fdo::Result<u32> {
        tracing::info!(identity_id, "remove requested");
        let service = Arc::clone(&self.service);
        let identity_id = identity_id.trim().to_string();
        let removed = unblock(&self.runtime, move || service.remove(&identity_id))
            .await?
            .map_err(service_error)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Enrolled identity IDs as a JSON array.
    async fn list_identities(&self) -> fdo::Result<String> {
        to_json(&self.service.identities())
    }

    /// Students with a registered face, most recent first, as JSON.
    async fn registered_students(&self) -> fdo::Result<String> {
        let service = Arc::clone(&self.service);
        let students = unblock(&self.runtime, move || service.registered_students())
            .await?
            .map_err(service_error)?;
        to_json(&students)
    }

    /// Attendance log for `date` (YYYY-MM-DD, empty for today), most recent first.
    async fn history(&self, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let service = Arc::clone(&self.service);
        let entries = unblock(&self.runtime, move || service.history(date))
            .await?
            .map_err(service_error)?;
        to_json(&serde_json::json!({
            "date": date.format("%Y-%m-%d").to_string(),
            "total": entries.len(),
            "data": entries,
        }))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": self.service.status(),
        }))
    }
}

/// Run blocking store work on the runtime's blocking pool.
async fn unblock<T, F>(runtime: &Handle, f: F) -> fdo::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    runtime
        .spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("request worker failed: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization: {e}")))
}

fn parse_date(date: &str) -> fdo::Result<NaiveDate> {
    let date = date.trim();
    if date.is_empty() {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| fdo::Error::InvalidArgs(format!("invalid date {date:?}: expected YYYY-MM-DD")))
}

fn service_error(e: AttendanceError) -> fdo::Error {
    match e {
        AttendanceError::Persistence(_) | AttendanceError::Store(_) => {
            tracing::error!(error = %e, "request failed");
            fdo::Error::Failed(e.to_string())
        }
        _ => {
            tracing::warn!(error = %e, "request rejected");
            fdo::Error::InvalidArgs(e.to_string())
        }
    }
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::InvalidImage(_) => fdo::Error::InvalidArgs(e.to_string()),
        _ => {
            tracing::error!(error = %e, "face encoder failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}
