#![doc = include_str!("../README.md")]

extern crate bitcoin;

pub mod chains;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod messenger;
pub mod protocol;
pub mod rpc;
pub mod store;
pub mod utill;
pub mod wallet;
