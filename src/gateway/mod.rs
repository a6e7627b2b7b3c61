//! REST and WebSocket gateway

pub mod auth;
pub mod broadcast;
pub mod cors;
pub mod forward;
mod router;
mod server;
mod ws;

pub use auth::{AuthorizationGate, Decision, Denial, Surface};
pub use broadcast::{
    BroadcasterState, NotificationBroadcaster, NotificationSender, QueueItem, SessionFrames,
    SessionId, SessionRegistry,
};
pub use cors::OriginPolicy;
pub use forward::{Forwarded, RpcForwarder};
pub use router::{AppState, create_router};
pub use server::{Gateway, GatewayInstances, RunningGateway};
