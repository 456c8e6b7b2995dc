// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The runtime: holds every local interpreter, dispatches them
//! cooperatively, tracks origin-side program status and migrates threads.

mod command;
mod error;
mod package;
mod scheduler;

pub use command::{Command, Reply, RuntimeHandle};
pub use error::RuntimeError;
pub use package::ThreadPackage;
pub use scheduler::{generate_runtime_id, Runtime};
