pub mod board;
pub mod poller;
pub mod state;

pub use board::StatusBoard;
pub use poller::{PollHandle, PollOutcome, StatusPoller};
pub use state::{IndexingStatus, ItemStatus, TransitionError, reconcile};
