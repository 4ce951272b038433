//! Screen on/off switch persisted as a flag file

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

const FLAG_CONTENTS: &str = "ScreenOFF";

/// Screen state; the flag file exists while the screen is off
pub struct ScreenSwitch {
    flag_path: PathBuf,
    enabled: Mutex<bool>,
}

impl ScreenSwitch {
    /// Load the initial state from the flag file
    pub fn load(flag_path: impl Into<PathBuf>) -> Self {
        let flag_path = flag_path.into();
        let enabled = !flag_path.exists();
        Self {
            flag_path,
            enabled: Mutex::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Switch the screen and persist the new state
    pub async fn set(&self, enabled: bool) -> Result<()> {
        if enabled {
            match tokio::fs::remove_file(&self.flag_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tokio::fs::write(&self.flag_path, FLAG_CONTENTS).await?;
        }

        *self.enabled.lock() = enabled;
        info!(enabled, "Screen switched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flag_file_round_trip() {
        let path = std::env::temp_dir().join(format!("rota-modem-screen-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let screen = ScreenSwitch::load(&path);
        assert!(screen.is_enabled());

        screen.set(false).await.unwrap();
        assert!(!screen.is_enabled());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ScreenOFF");

        // State survives a reload.
        assert!(!ScreenSwitch::load(&path).is_enabled());

        screen.set(true).await.unwrap();
        screen.set(true).await.unwrap();
        assert!(screen.is_enabled());
        assert!(!path.exists());
    }
}
