pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod frame;
pub mod template;
