//! Shared types for the warden capability broker.
//!
//! Everything that crosses a crate boundary lives here: the operation
//! envelope the agent side submits, the `BrokerResult` it gets back, the
//! uniform structured error, and the row types persisted by the stores.

mod error;
mod operation;

pub use error::ErrorCode;
pub use error::OpError;
pub use operation::BrokerResult;
pub use operation::ExecutionLogEntry;
pub use operation::OperationRequest;
pub use operation::OperationStatus;
pub use operation::OutboxEntry;
pub use operation::OutboxStatus;
pub use operation::PostponedOperation;
pub use operation::PostponementStatus;
pub use operation::Tier;
