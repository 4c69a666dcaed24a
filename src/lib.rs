#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sentrybox only works on linux or android");

#[macro_use]
extern crate lazy_static;

pub mod context;
pub mod control;
pub mod errors;
pub mod kernel;
pub mod memory;
pub mod spec;
pub mod state;
pub mod sync;
pub mod time;
pub mod vfs;
pub mod waiter;

pub use crate::{
    control::container::{Container, ContainerArgs, Status},
    kernel::Kernel,
};
