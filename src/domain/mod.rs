//! Domain model and ports.
//!
//! Value types shared by routing, the gate, retry control and the event
//! consumer, plus the traits every external collaborator is reached through.

pub mod account;
pub mod audit;
pub mod credential;
pub mod event;
pub mod ports;
pub mod processor;
pub mod transaction;
pub mod verdict;
