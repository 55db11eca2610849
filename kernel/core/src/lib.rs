#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod block;
pub mod boot;
pub mod config;
pub mod console;
pub mod consts;
pub mod drivers;
pub mod exec;
pub mod fs;
pub mod input;
pub mod logger;
pub mod memory;
pub mod panic;
pub mod shell;
pub mod task;
pub mod time;

#[cfg(feature = "kernel_test")]
pub mod self_test;

pub use arch::hlt_loop;

pub fn project_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
