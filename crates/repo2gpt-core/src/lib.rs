pub mod events;
pub mod ids;
pub mod job;
pub mod source;
pub mod tokens;
