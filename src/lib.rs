pub mod backend;
pub mod error;
pub mod loader;
pub mod num_util;
pub mod registry;
pub mod serde;
pub mod serialize;
pub mod state;
pub mod timeline;
