//! HTTP surface for the segmentation service.

pub mod rest;
pub mod server;
pub mod swagger;

pub use rest::AppState;
pub use server::ApiServer;
pub use swagger::ApiDoc;
