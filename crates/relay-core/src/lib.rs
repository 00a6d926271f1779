pub mod connection;
pub mod errors;
pub mod functions;
pub mod ids;
pub mod message;

pub use connection::{ConnectionInfo, ConnectionStats};
pub use errors::RelayError;
pub use functions::{FunctionSpec, FunctionStats, InvocationRequest, InvocationResponse};
pub use ids::{ConnectionId, RequestId};
pub use message::SseMessage;
