pub mod emitter;
pub mod manager;
pub mod model;
pub mod worker;
