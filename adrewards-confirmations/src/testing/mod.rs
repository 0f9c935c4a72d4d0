//! Test utilities for the confirmations engines.
//!
//! - [`MockConfirmationsServer`]: an in-process issuer with a real signing
//!   key, scripted failures and call counters
//! - [`RecordingDelegate`]: records every delegate notification
//!
//! ```rust,ignore
//! use adrewards_confirmations::testing::{MockConfirmationsServer, Operation};
//!
//! let server = Arc::new(MockConfirmationsServer::new());
//! server.fail_next(Operation::CreateConfirmation, EndpointError::Status { status: 503 });
//! ```

mod mock_server;
mod recording_delegate;

pub use mock_server::{MockConfirmationsServer, Operation};
pub use recording_delegate::{DelegateEvent, RecordingDelegate};
