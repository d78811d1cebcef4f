pub mod align;
pub mod config;
pub mod correlation;
pub mod domain;
pub mod error;
pub mod events;
pub mod fs_util;
pub mod geo;
pub mod matrix;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod soft;
pub mod store;
