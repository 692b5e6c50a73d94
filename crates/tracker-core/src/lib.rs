#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod fs;
pub mod network;
pub mod provisioning;
pub mod status;
