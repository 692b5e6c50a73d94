#![no_std]

pub mod network;
pub mod provisioning;
pub mod storage;
