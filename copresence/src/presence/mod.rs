//! Presence: the local state machine, the directory of other users, the
//! pairing handshake and the legacy activity adapter.

pub mod directory;
pub mod engine;
pub mod legacy;
pub mod pairing;

pub use directory::{ApplyOutcome, PresenceDirectory};
pub use engine::{EngineOutput, PresenceEngine, PresenceTransition};
pub use pairing::{AckOutcome, HandshakeState, PairingContext, PairingHandshake, PairingSource, Resend};
