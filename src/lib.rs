pub mod backends;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gcp;
pub mod gradcam;
pub mod handlers;
pub mod image_utils;
pub mod labels;
pub mod models;
pub mod report;
pub mod state;
pub mod storage;

pub use error::{Error, Result};
