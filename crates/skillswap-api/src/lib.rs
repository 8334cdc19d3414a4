pub mod auth;
pub mod credits;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod presence;
pub mod sessions;
