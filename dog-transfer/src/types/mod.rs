pub mod events;
pub mod filter;
pub mod ids;
pub mod range;
pub mod record;
pub mod state;

pub use events::{TransferEvent, TransferEventKind, TransferSnapshot};
pub use filter::TransferFilter;
pub use ids::{RestorationId, TransferId};
pub use range::ByteRange;
pub use record::{ChunkRecord, RemoteRef, TransferRecord};
pub use state::{Direction, PauseReason, TransferState};
