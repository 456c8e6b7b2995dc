// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use clap::Parser;

/// One node of a gridvm cluster: joins the multicast group, loads the
/// given programs and drops into the operator shell.
#[derive(Parser, Debug)]
#[command(name = "gridvm", version, about)]
pub struct Cli {
    /// IP address of the local interface to advertise and multicast on.
    /// Use 0.0.0.0 to auto-detect from the default route.
    pub interface: Ipv4Addr,

    /// Program descriptors (.mtss) to load at startup.
    pub programs: Vec<PathBuf>,

    /// Multicast group used for peer discovery and announcements.
    #[arg(long, default_value = "224.0.0.1:19999")]
    pub group: SocketAddrV4,

    /// Increase log verbosity (-v: info, -vv: debug). GRIDVM_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
