pub mod instance;
pub mod ip_history;

pub use instance::*;
pub use ip_history::*;
