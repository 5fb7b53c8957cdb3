pub mod api;
pub mod registry;
pub mod router;
pub mod series;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod types;
pub mod upload;
