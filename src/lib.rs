#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod util;
pub mod log;
pub mod settings;
pub mod layout;
pub mod procfs;
pub mod types;
pub mod value;
pub mod object;
pub mod context;
pub mod pretty;

#[cfg(test)]
pub mod testing;
