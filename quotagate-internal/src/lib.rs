pub mod completion; // downstream completion API boundary
pub mod config_parser; // gateway config file
pub mod counter_store; // atomic counter primitive (Redis / in-memory)
pub mod endpoints; // HTTP surface
pub mod error; // error handling
pub mod gateway_util; // shared state and component wiring
pub mod observability; // log setup
pub mod quota; // dual-layer quota ledger and reconciliation
pub mod selector; // model tier selection with hysteresis
