// SPDX-License-Identifier: Apache-2.0

//! Input configuration and runner supervision.

pub mod config;
pub mod manager;
pub mod runner;
pub mod stdin;

pub use config::{InputConfig, InputKind, JsonConfig};
pub use manager::InputManager;
pub use runner::{Runner, RunnerDeps, RunnerState};
