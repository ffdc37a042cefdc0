//! HTTP surface of the upload gateway

mod router;
mod server;

pub use router::{AppState, UploadQuery, create_router, outcome_response};
pub use server::{Gateway, build_service};
