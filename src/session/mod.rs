//! Session freshness for the installed app shell.

mod monitor;
mod platform;
mod provider;
mod types;

pub use monitor::SessionMonitor;
pub use platform::{terminal_events, ShellHints};
pub use provider::{IdentityProvider, SessionStore, SupabaseAuth};
