//! Configuration schema and file loading

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
