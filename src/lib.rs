//! c2mesh - C2 core bring-up and P2P callback topology
//!
//! Connects to the message broker, starts every registered queue consumer,
//! and maintains the live graph of peer-to-peer links between agent
//! callbacks, persisted with soft-delete history.

pub mod bus;
pub mod config;
pub mod context;
pub mod graph;
pub mod handlers;
pub mod notify;
pub mod orchestration;
pub mod storage;
pub mod utils;
