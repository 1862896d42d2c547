#![doc = include_str!("../README.md")]

pub mod beam;
pub mod chunk;
pub mod proxy;
