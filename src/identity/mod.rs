//! Session, role resolution and route gating for the classroom dashboard.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod provider;
mod resolver;
mod session;
mod handshake;
mod gate;
mod coordinator;

pub use principal::{Credentials, Identity, Profile, ProfileMetadata, Role, Session, SignUpFields};
pub use provider::{
    AuthEvent, IdentityProvider, ProfileError, ProfileStore, ProviderError, SignInError, SignUpError,
};
pub use resolver::{RoleEvent, RoleResolution, RoleResolver};
pub use session::{SessionSnapshot, SessionStatus, SessionStore, DEFAULT_CONFIRM_TIMEOUT};
pub use handshake::{AuthHandshake, HandshakeState, SignInOutcome, SignUpConfirmation};
pub use gate::{decide, route_decision, GateVariant, Route, RouteDecision};
pub use coordinator::{GateCoordinator, GateView};
