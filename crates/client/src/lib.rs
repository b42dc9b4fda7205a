//! Wavecast client: WebRTC streaming sessions over a WebSocket signaling
//! relay.
//!
//! A [`Session`] owns the signaling channel, one peer link per remote
//! participant, and a snapshot-readable state store. All signaling frames
//! and transport callbacks funnel through a single event queue, so state
//! transitions happen in arrival order on one task.

pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod state;

mod registry;
mod router;
mod signaling;

pub use error::SessionError;
pub use media::{LocalMedia, MediaConstraints, MediaSource, SampleTrackSource};
pub use peer::{NegotiationState, RemoteStream, RemoteTrackInfo};
pub use session::{Identity, Session, StreamOptions};
pub use state::{ConnectionState, Role, SessionAction, SessionState};
pub use wavecast_protocol as protocol;
