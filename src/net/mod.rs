//! Request/response snapshots and the network transport they travel over.

pub mod transport;
pub mod types;

pub use transport::{validate_request, HttpTransport, Transport};
pub use types::{Request, Response};
