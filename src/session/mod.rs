//! Per-user session management
//!
//! [`SessionManager`] hands out [`SessionHandle`]s, one actor per user id.
//! A handle tracks the user's active provider and the authenticated context
//! of every provider they have used.

mod manager;
mod state;

pub use manager::{SessionHandle, SessionManager};
pub use state::{ProviderStatus, SessionState};
