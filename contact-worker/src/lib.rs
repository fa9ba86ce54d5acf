pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod stats;
pub mod validator;
