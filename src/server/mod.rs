//! HTTP surface over the inference engine

mod handlers;
mod server;

pub use handlers::{
    ApiError, ClassifyRequest, ClassifyResponse, ErrorResponse, GenerateRequest, GenerateResponse,
    ProcessRequest, ProcessResponse,
};
pub use server::{app, serve, AppState};
