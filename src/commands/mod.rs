pub mod completions;
pub mod mount;
pub mod plugins;
