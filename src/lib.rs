//! classgate: session, role resolution and route gating for a classroom dashboard,
//! plus a keyed single-flight guard for user-triggered mutations.

pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod memory;
pub mod notify;
pub mod resources;
pub mod server;

pub use config::GateConfig;
pub use error::{ErrorBody, GateError, GateResult};
pub use guard::{GuardEvent, GuardPolicy, MutationGuard, OperationState, PendingOutcome};
pub use notify::{Notifier, Subscription};
