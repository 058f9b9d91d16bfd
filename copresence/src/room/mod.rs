//! Room state synchronization against the server of record.

pub mod api;
pub mod dedup;
pub mod memory;
pub mod pending;
pub mod sync;

pub use api::{ApiError, HttpRoomApi, RoomApi};
pub use memory::InMemoryRoomApi;
pub use pending::{MutationKind, MutationStatus, PendingMutation};
pub use sync::{Reconciliation, RoomSync};
