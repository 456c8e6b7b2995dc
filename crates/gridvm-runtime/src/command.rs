// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Operator commands.
//!
//! The shell submits commands through a queue and blocks on a per-command
//! reply channel, so the scheduler processes them between dispatch ticks
//! without any shared locking.

use tokio::sync::{mpsc, oneshot};

use gridvm_proto::{ProgramId, RuntimeId, ThreadId};

use crate::error::RuntimeError;

#[derive(Debug)]
pub enum Command {
    /// Programs currently executing here, with their local thread ids.
    ListPrograms,
    /// Move one thread to another runtime.
    Migrate {
        program: ProgramId,
        thread: ThreadId,
        target: RuntimeId,
    },
    /// Migrate away foreign threads and stop the dispatch loop.
    Shutdown,
}

#[derive(Debug)]
pub enum Reply {
    Programs(Vec<(ProgramId, Vec<ThreadId>)>),
    MigrationResult(Result<RuntimeId, String>),
    ShuttingDown,
}

pub(crate) type CommandEnvelope = (Command, oneshot::Sender<Reply>);

/// Shell-side handle; blocks the calling (non-async) thread per request.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<CommandEnvelope>,
    pub(crate) runtime_id: RuntimeId,
}

impl RuntimeHandle {
    pub fn runtime_id(&self) -> &RuntimeId {
        &self.runtime_id
    }

    pub fn request(&self, command: Command) -> Result<Reply, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send((command, reply_tx))
            .map_err(|_| RuntimeError::SchedulerGone)?;
        reply_rx.blocking_recv().map_err(|_| RuntimeError::SchedulerGone)
    }
}
