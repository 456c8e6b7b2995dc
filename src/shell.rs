// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The interactive operator shell.
//!
//! Runs on a blocking thread; every command goes through the scheduler's
//! command queue, so the shell never touches runtime state directly.
//! Listing commands print indices which `migrate` accepts in place of the
//! raw ids.

use std::io::{self, BufRead, Write};

use gridvm_comms::PeerTable;
use gridvm_net::NetHandle;
use gridvm_proto::{ProgramId, RuntimeId, ThreadId};
use gridvm_runtime::{Command, Reply, RuntimeHandle};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Shell {
    runtime: RuntimeHandle,
    peers: PeerTable,
    net: NetHandle,
    /// Last `list_runtimes` result, for index-based addressing.
    runtimes: Vec<RuntimeId>,
    /// Last `list_programs` result, for index-based addressing.
    programs: Vec<(ProgramId, Vec<ThreadId>)>,
}

impl Shell {
    pub fn new(runtime: RuntimeHandle, peers: PeerTable, net: NetHandle) -> Self {
        Shell {
            runtime,
            peers,
            net,
            runtimes: Vec::new(),
            programs: Vec::new(),
        }
    }

    /// Read-eval loop; returns after `exit`, `shutdown` or EOF.
    pub fn run(mut self) -> anyhow::Result<()> {
        self.version();
        println!("Try 'help' for commands");

        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("~> ");
            io::stdout().flush()?;

            line.clear();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            match self.dispatch(line.trim()) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => println!("error: {e}"),
            }
        }
        self.shutdown()
    }

    /// Returns `Ok(false)` when the shell should stop.
    fn dispatch(&mut self, line: &str) -> anyhow::Result<bool> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Ok(true);
        };
        let args: Vec<&str> = parts.collect();

        match (command, args.as_slice()) {
            ("this", []) => {
                println!("My id is: {}", self.runtime.runtime_id());
            }
            ("list_runtimes", []) => self.list_runtimes(),
            ("list_programs", []) => self.list_programs()?,
            ("migrate", [program, thread, runtime]) => {
                self.migrate(program, thread, runtime)?;
            }
            ("migrate", _) => {
                println!("usage: migrate <program> <thread> <runtime>");
            }
            ("shutdown", []) | ("exit", []) => {
                self.shutdown()?;
                return Ok(false);
            }
            ("version", []) => self.version(),
            ("help", []) => self.help(),
            _ => println!("bad command: \"{line}\". Try \"help\""),
        }
        Ok(true)
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    fn list_runtimes(&mut self) {
        self.runtimes.clear();
        for (index, (id, addr)) in self.peers.snapshot().into_iter().enumerate() {
            let marker = if &id == self.runtime.runtime_id() {
                " >>ME<<"
            } else {
                ""
            };
            println!("runtime {index}: [{id}]{marker} @ {addr}");
            self.runtimes.push(id);
        }
    }

    fn list_programs(&mut self) -> anyhow::Result<()> {
        match self.runtime.request(Command::ListPrograms)? {
            Reply::Programs(listing) => {
                self.programs = listing;
                if self.programs.is_empty() {
                    println!("no programs running here");
                }
                for (index, (program, threads)) in self.programs.iter().enumerate() {
                    println!("program {index}: {program}");
                    for thread in threads {
                        println!("    thread {thread}");
                    }
                }
            }
            other => println!("unexpected reply: {other:?}"),
        }
        Ok(())
    }

    fn migrate(&mut self, program: &str, thread: &str, runtime: &str) -> anyhow::Result<()> {
        // Refresh both listings so indices refer to current state.
        self.list_runtimes();
        match self.runtime.request(Command::ListPrograms)? {
            Reply::Programs(listing) => self.programs = listing,
            _ => {}
        }

        let Some(program) = self.resolve_program(program) else {
            println!("no such program: {program}");
            return Ok(());
        };
        let Ok(thread) = thread.parse::<ThreadId>() else {
            println!("bad thread id: {thread}");
            return Ok(());
        };
        let Some(target) = self.resolve_runtime(runtime) else {
            println!("no such runtime: {runtime}");
            return Ok(());
        };

        match self.runtime.request(Command::Migrate {
            program,
            thread,
            target,
        })? {
            Reply::MigrationResult(Ok(acceptor)) => {
                println!("thread migrated to [{acceptor}]")
            }
            Reply::MigrationResult(Err(reason)) => println!("migration failed: {reason}"),
            other => println!("unexpected reply: {other:?}"),
        }
        Ok(())
    }

    /// Accept a listing index or a raw program id.
    fn resolve_program(&self, arg: &str) -> Option<ProgramId> {
        if let Ok(index) = arg.parse::<usize>() {
            if let Some((program, _)) = self.programs.get(index) {
                return Some(program.clone());
            }
        }
        self.programs
            .iter()
            .map(|(program, _)| program)
            .find(|program| program.as_str() == arg)
            .cloned()
    }

    /// Accept a listing index or a raw runtime id.
    fn resolve_runtime(&self, arg: &str) -> Option<RuntimeId> {
        if let Ok(index) = arg.parse::<usize>() {
            if let Some(id) = self.runtimes.get(index) {
                return Some(id.clone());
            }
        }
        self.runtimes
            .iter()
            .find(|id| id.as_str() == arg)
            .cloned()
    }

    fn version(&self) {
        println!("GridVM shell v{VERSION}");
    }

    fn help(&self) {
        println!("this                                  - print this runtime's id");
        println!("list_runtimes                         - list all runtimes");
        println!("list_programs                         - list programs on this runtime");
        println!("migrate <program> <thread> <runtime>  - move a thread (indices or ids)");
        println!("shutdown                              - shut this runtime down");
        println!("version                               - display version information");
        println!("help                                  - this text");
        println!("exit                                  - shut down and leave");
    }

    // ── Shutdown sequence ────────────────────────────────────────────────────

    /// Spec order: refuse incoming migrations, migrate away foreign
    /// threads, then broadcast SHUTDOWN_REQ and drain.
    fn shutdown(&self) -> anyhow::Result<()> {
        println!("shutting down...");
        self.net.prepare_shutdown();
        self.runtime.request(Command::Shutdown)?;
        self.net.shutdown();
        Ok(())
    }
}
