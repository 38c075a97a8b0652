pub mod classifier;
pub mod exit_hook;
pub mod line_buffer;
pub mod remediation;
