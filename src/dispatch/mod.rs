pub mod dispatcher;
pub mod handlers;
