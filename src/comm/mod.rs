pub mod byte_counter;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod message_core;
pub mod message_filter;
pub mod peer;
pub mod schema;
pub mod transport;
