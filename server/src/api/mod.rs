pub mod auth;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;

pub use auth::AuthService;
pub use server::ApiServer;
