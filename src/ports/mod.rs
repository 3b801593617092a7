//! Ports - Trait definitions for every outbound collaborator.

pub mod bus;
pub mod cache;
pub mod encoder;
pub mod repository;
pub mod storage;
