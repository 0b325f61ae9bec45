//! Operation dispatch, tracking and reattachment.

mod dispatcher;
mod handle;
mod reattach;
mod registry;

pub use dispatcher::CommandDispatcher;
pub use handle::OperationHandle;
pub use reattach::ReattachmentCoordinator;
pub use registry::{DispatchId, OperationState, Outcome, PendingOperation, PendingRegistry};
