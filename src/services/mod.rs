//! Background services and process-level state

pub mod ip_log;
pub mod night_window;
pub mod refresh;
pub mod screen;

pub use ip_log::IpLog;
pub use night_window::NightWindow;
pub use refresh::{RefreshHandle, RefreshService};
pub use screen::ScreenSwitch;
