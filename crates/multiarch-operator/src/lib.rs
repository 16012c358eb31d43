//! Architecture-aware pod placement
//!
//! The admission webhook gates new pods, the pod controller resolves the
//! architectures their images support and writes node affinity before
//! lifting the gate.

#![deny(missing_docs)]

pub mod affinity;
pub mod controller;
pub mod controller_runner;
pub mod gate;
pub mod watchers;
pub mod webhook;
