pub mod auth;
pub mod path_guard;
