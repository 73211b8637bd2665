#![doc = include_str!("../README.md")]

pub mod handles;
pub mod path;
pub mod store;
