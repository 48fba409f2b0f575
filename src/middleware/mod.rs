//! Request-level middleware and extractors

pub mod request_id;
pub mod user;

pub use request_id::request_id_layer;
pub use user::CurrentUser;
