pub mod api;
pub mod cache;
pub mod error;
pub mod handlers;
pub mod models;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
