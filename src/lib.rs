#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub mod config;
pub mod docker;
pub mod executor;
pub mod failure;
pub mod fingerprint;
pub mod format;
pub mod graph;
pub mod parser;
pub mod recipe;
pub mod runner;
pub mod script;
pub mod state;
pub mod status;
pub mod template;
