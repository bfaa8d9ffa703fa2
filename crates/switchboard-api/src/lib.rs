pub mod auth;
pub mod conversations;
pub mod error;
pub mod feed;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod users;

pub use auth::{AppState, AppStateInner};
pub use routes::router;
