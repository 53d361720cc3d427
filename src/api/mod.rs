//! HTTP surface: agent endpoints, client endpoints and the realtime route.

mod agent_api;
mod deployments_api;
mod experiments_api;
mod server;
mod types;
mod ws;

pub use agent_api::HOST_ID_HEADER;
pub use server::{ApiState, router, start};
pub use types::ApiError;
