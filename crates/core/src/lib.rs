//! Core crate for roomcook: task dispatch to engine workers, the pixel
//! codec, and the request/user-stack logs.

pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod error;
pub mod layout;
pub mod log_store;
pub mod logging;
pub mod pixel_codec;
pub mod process;
pub mod processor;
pub mod processors;
pub mod registry;
pub mod request;
pub mod server;
