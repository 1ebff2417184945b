//! Crier core library: message bus, agent loop, tools, cron scheduler, subagents, and the
//! gateway that wires them to chat channels. Used by the `crier` CLI.

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod cron;
pub mod gateway;
pub mod heartbeat;
pub mod init;
pub mod llm;
pub mod session;
pub mod tools;
