pub mod cancellation;
pub mod coordinator;
pub mod fingerprint;
pub mod keys;
pub mod memory;
pub mod ports;
pub mod priority;
pub mod streaming;
pub mod util;

pub use cancellation::{CancellationChecker, CancellationQuery};
pub use coordinator::{
    ActiveRequestPointer, CoordinationService, CoordinatorConfig, DedupStatus, RequestCoordinator,
    RequestTicket, StoredResponse, WaitResult,
};
pub use fingerprint::RequestIdentity;
pub use memory::InMemoryKvStore;
pub use priority::PriorityTable;
pub use streaming::{StreamingConfig, StreamingCoordinator};
