//! Expiring, per-session conversational state with fail-fast serialization.

pub mod error;
pub mod session;
pub mod store;

pub use error::StoreError;
pub use session::{AgentResult, AgentState, Session, SessionGuard, SessionInfo, SessionState};
pub use store::{SessionStore, StoreConfig};
