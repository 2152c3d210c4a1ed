pub mod command;
pub mod runner;

pub use command::CliInvocation;
pub use runner::{Runner, StreamChunk};
