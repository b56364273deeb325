pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod hub;

pub use dispatcher::Dispatcher;
pub use error::HubError;
pub use hub::{Actor, Hub};
