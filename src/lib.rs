pub mod awareness;
pub mod bridge;
pub mod bus;
pub mod clock;
pub mod config;
pub mod convergence;
pub mod cycle;
pub mod error;
pub mod events;
pub mod field;
pub mod ledger;
pub mod logging;
pub mod regulator;
pub mod reliability;
pub mod repair;
pub mod replay;
pub mod runtime;
pub mod stream;
pub mod telemetry;
pub mod tensor;
