//! Append-only audit log of health-probe results

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::ProbeOutcome;

/// Serialises appends to the probe audit file
pub struct IpLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IpLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `<time>;<instance>;<ip|->;<outcome>` line
    pub async fn append(&self, instance_id: u32, ip: Option<Ipv4Addr>, outcome: ProbeOutcome) -> Result<()> {
        let line = format_line(Utc::now(), instance_id, ip, outcome);

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn format_line(at: DateTime<Utc>, instance_id: u32, ip: Option<Ipv4Addr>, outcome: ProbeOutcome) -> String {
    let ip = ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{};{};{};{}\n",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        instance_id,
        ip,
        outcome
    )
}
