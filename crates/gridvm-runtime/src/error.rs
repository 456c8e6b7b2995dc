// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use gridvm_comms::CommsError;
use gridvm_proto::ThreadUid;
use gridvm_vm::VmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Comms(#[from] CommsError),

    #[error("no such thread {0}")]
    NoSuchThread(ThreadUid),

    #[error("no peer accepted the thread")]
    MigrationRefused,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("the scheduler is gone")]
    SchedulerGone,
}
