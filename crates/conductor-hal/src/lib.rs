//! `conductor-hal` – Hardware Abstraction Layer
//!
//! The boundary between the orchestrator and vendor SDK bindings.
//!
//! # Modules
//!
//! - [`module`] – [`HardwareModule`][module::HardwareModule]: the five-method
//!   lifecycle/command contract plus an outbound telemetry stream that every
//!   hardware subsystem (motion, audio, video, LED, sensors) implements.
//! - [`registry`] – [`ModuleRegistry`][registry::ModuleRegistry]: id-keyed
//!   registry that validates the dependency graph as a DAG at registration
//!   time and yields dependency-ordered start levels.
//! - [`sim`] – [`SimModule`][sim::SimModule]: a scriptable in-process module
//!   for tests, CI and the CLI demo.

pub mod module;
pub mod registry;
pub mod sim;

pub use module::{HardwareModule, ModuleConfig};
pub use registry::{ModuleRegistry, RegisteredModule, StartPlan};
pub use sim::{SimModule, SimSensor};
