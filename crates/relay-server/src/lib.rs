pub mod connections;
pub mod dispatch;
pub mod functions;
pub mod handlers;
pub mod server;
pub mod stream;

pub use connections::ConnectionRegistry;
pub use dispatch::{FunctionInvoker, HttpInvoker, InvocationDispatcher, OutboundCall, OutboundResponse};
pub use functions::FunctionRegistry;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
