// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use gridvm_proto::ThreadUid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("no runtime claims thread {0}")]
    UnknownThread(ThreadUid),

    #[error("migration target is this runtime")]
    SelfMigration,

    #[error("migration outcome never arrived")]
    MigrationTimeout,
}
