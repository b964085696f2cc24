//! HTTP and WebSocket boundary over the squad engine: squad and task
//! CRUD, approval resolution, and cursor-resumable task output streams.

pub mod api_error;
pub mod http_api;
pub mod protocol;

pub use api_error::ApiError;
pub use http_api::{api_router, scripted_factory, ApiState, BehaviorFactory};
pub use protocol::StreamFrame;
