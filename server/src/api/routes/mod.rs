pub mod admin;
pub mod encoding;
pub mod health;
pub mod ingest;
pub mod query;
pub mod stream;
