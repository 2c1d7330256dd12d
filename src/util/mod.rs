// Shared plumbing for the installation backend

pub mod cmd;
pub mod fs;
pub mod macros;
pub mod sys;
