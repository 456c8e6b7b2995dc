// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The communication bus: everything the scheduler and the net handler
//! share. The bus owns the inboxes, the forwarding table and the queues;
//! neither worker reaches into the other's private state.

mod bus;
mod error;
mod peers;

pub use bus::{CommsBus, MessageBundle, OutboundReceiver, StatusEvent};
pub use error::CommsError;
pub use peers::PeerTable;
