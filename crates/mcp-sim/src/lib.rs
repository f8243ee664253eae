//! Simulated MCP server for development and tests.
//!
//! `SimServer` implements `McpTransport` and `TranscriptionBackend`
//! in-process. Failure behaviour is injected through a `FaultPolicy`, so
//! production crates carry no simulation branches.

pub mod fault;
pub mod server;

pub use fault::{Fault, FaultPolicy, NoFaults, Operation, RandomFaults, ScriptedFaults, SimConfig, WordFate};
pub use server::{Classification, SimServer, classify_text};
