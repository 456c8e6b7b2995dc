// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The cooperative scheduler.
//!
//! A single blocking worker multiplexes every local interpreter, one
//! instruction per ready thread per tick. Between ticks it drains operator
//! commands, incoming migrations, status updates and print requests. The
//! scheduler is the sole mutator of interpreter internals.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use gridvm_comms::{CommsBus, StatusEvent};
use gridvm_proto::{ProgramId, RuntimeId, ThreadId, ThreadStatus, ThreadUid};
use gridvm_vm::{loader, parse_descriptor, Interpreter, MessagePort, StepResult};

use crate::command::{Command, CommandEnvelope, Reply, RuntimeHandle};
use crate::error::RuntimeError;
use crate::package::ThreadPackage;

/// Nap taken when no interpreter is ready.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// A runtime id for this process instance, derived from its start time.
pub fn generate_runtime_id() -> RuntimeId {
    RuntimeId::derive(&chrono::Utc::now().to_rfc3339())
}

pub struct Runtime {
    id: RuntimeId,
    comms: CommsBus,
    /// Every interpreter executing here, including migrated-in foreigners.
    programs: HashMap<ProgramId, BTreeMap<ThreadId, Interpreter>>,
    /// Origin-side bookkeeping: thread statuses of programs loaded here,
    /// wherever those threads currently run.
    own_programs: HashMap<ProgramId, BTreeMap<ThreadId, ThreadStatus>>,
    cmd_rx: mpsc::UnboundedReceiver<CommandEnvelope>,
    running: bool,
}

impl Runtime {
    pub fn new(comms: CommsBus) -> (Self, RuntimeHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let id = comms.runtime_id().clone();
        let handle = RuntimeHandle {
            cmd_tx,
            runtime_id: id.clone(),
        };
        let runtime = Runtime {
            id,
            comms,
            programs: HashMap::new(),
            own_programs: HashMap::new(),
            cmd_rx,
            running: true,
        };
        (runtime, handle)
    }

    pub fn id(&self) -> &RuntimeId {
        &self.id
    }

    // ── Program loading ──────────────────────────────────────────────────────

    /// Load a `.mtss` descriptor and create one interpreter per thread.
    pub fn load_program(&mut self, path: &Path) -> Result<ProgramId, RuntimeError> {
        tracing::debug!("loading program {}", path.display());
        let descriptor = parse_descriptor(path)?;

        for spec in &descriptor.threads {
            let code = loader::load(&spec.source_file)?;
            let mut interpreter = Interpreter::new(
                self.id.clone(),
                spec.program_id.clone(),
                spec.thread_id,
                code,
            );
            interpreter.start(&spec.argv);

            let uid = interpreter.uid().clone();
            self.comms.update_thread_location(uid, self.id.clone());
            self.own_programs
                .entry(spec.program_id.clone())
                .or_default()
                .insert(spec.thread_id, interpreter.status());
            self.programs
                .entry(spec.program_id.clone())
                .or_default()
                .insert(spec.thread_id, interpreter);
        }

        tracing::info!(
            "program {} loaded with {} threads",
            descriptor.program_id,
            descriptor.threads.len()
        );
        Ok(descriptor.program_id)
    }

    // ── Dispatch loop ────────────────────────────────────────────────────────

    /// Run until shutdown.
    pub fn run(&mut self) {
        while self.running {
            if !self.tick() && self.running {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One scheduler turn: drain requests, then execute one instruction on
    /// every ready interpreter. Returns whether anything ran.
    pub fn tick(&mut self) -> bool {
        self.drain_requests();

        let run_list = self.build_run_list();
        if run_list.is_empty() {
            return false;
        }
        for uid in run_list {
            self.step_thread(&uid);
        }
        true
    }

    /// Ready threads, in insertion order: RUNNING ones, sleepers whose
    /// deadline passed, blocked ones with a deliverable message. Wake
    /// transitions are reported to the origin like any other transition.
    fn build_run_list(&mut self) -> Vec<ThreadUid> {
        let now = Instant::now();
        let mut run_list = Vec::new();
        let mut wakes: Vec<(ThreadUid, RuntimeId)> = Vec::new();

        for threads in self.programs.values_mut() {
            for interpreter in threads.values_mut() {
                let uid = interpreter.uid().clone();
                match interpreter.status() {
                    ThreadStatus::Running => run_list.push(uid),
                    ThreadStatus::Sleeping => {
                        if interpreter.wake_up_at().is_none_or(|at| at <= now) {
                            interpreter.wake();
                            wakes.push((uid.clone(), interpreter.origin().clone()));
                            run_list.push(uid);
                        }
                    }
                    ThreadStatus::Blocked => {
                        let ready = interpreter
                            .waiting_from()
                            .is_some_and(|from| self.comms.can_receive_message(from, &uid));
                        if ready {
                            interpreter.wake();
                            wakes.push((uid.clone(), interpreter.origin().clone()));
                            run_list.push(uid);
                        }
                    }
                    _ => {}
                }
            }
        }

        for (uid, origin) in wakes {
            self.report_status(&uid, &origin, ThreadStatus::Running, None);
        }
        run_list
    }

    fn step_thread(&mut self, uid: &ThreadUid) {
        let Some(interpreter) = self
            .programs
            .get_mut(uid.program())
            .and_then(|threads| threads.get_mut(&uid.thread()))
        else {
            // Torn down earlier in this tick (crash or completed program).
            return;
        };

        let origin = interpreter.origin().clone();
        let port: &dyn MessagePort = &self.comms;
        match interpreter.step(port) {
            StepResult::Continued => {}
            StepResult::Blocked => {
                let waiting_from = interpreter.waiting_from().cloned();
                self.report_status(uid, &origin, ThreadStatus::Blocked, waiting_from);
            }
            StepResult::Sleeping(_) => {
                self.report_status(uid, &origin, ThreadStatus::Sleeping, None);
            }
            StepResult::Finished => {
                tracing::debug!("thread {uid} finished");
                self.remove_thread(uid);
                self.report_status(uid, &origin, ThreadStatus::Finished, None);
            }
            StepResult::Crashed(reason) => {
                tracing::error!("thread {uid} crashed: {reason}");
                self.teardown_program(uid.program());
                self.report_status(uid, &origin, ThreadStatus::Crashed, None);
            }
        }
    }

    // ── Requests between ticks ───────────────────────────────────────────────

    fn drain_requests(&mut self) {
        for event in self.comms.get_status_requests() {
            self.apply_own_status(event);
        }

        for (uid, text) in self.comms.get_print_requests() {
            println!("[{uid}] {text}");
        }

        for blob in self.comms.get_migrated_threads() {
            if let Err(e) = self.adopt_thread(&blob) {
                tracing::error!("cannot adopt migrated thread: {e}");
            }
        }

        while let Ok((command, reply_tx)) = self.cmd_rx.try_recv() {
            let reply = self.on_command(command);
            let _ = reply_tx.send(reply);
        }
    }

    fn on_command(&mut self, command: Command) -> Reply {
        match command {
            Command::ListPrograms => Reply::Programs(self.program_listing()),
            Command::Migrate {
                program,
                thread,
                target,
            } => {
                let result = self
                    .migrate_thread(&program, thread, Some(target))
                    .map_err(|e| e.to_string());
                Reply::MigrationResult(result)
            }
            Command::Shutdown => {
                self.shutdown();
                Reply::ShuttingDown
            }
        }
    }

    /// Sorted `(program, threads)` listing for the shell.
    pub fn program_listing(&self) -> Vec<(ProgramId, Vec<ThreadId>)> {
        let mut listing: Vec<_> = self
            .programs
            .iter()
            .map(|(pid, threads)| (pid.clone(), threads.keys().copied().collect()))
            .collect();
        listing.sort_by(|a, b| a.0.cmp(&b.0));
        listing
    }

    // ── Status bookkeeping ───────────────────────────────────────────────────

    /// Route a transition to the origin: locally if the thread is ours,
    /// over the bus otherwise.
    fn report_status(
        &mut self,
        uid: &ThreadUid,
        origin: &RuntimeId,
        status: ThreadStatus,
        waiting_from: Option<ThreadUid>,
    ) {
        if *origin == self.id {
            self.apply_own_status(StatusEvent {
                thread_uid: uid.clone(),
                status,
                waiting_from,
            });
        } else {
            self.comms
                .send_status_request(origin, uid.clone(), status, waiting_from);
        }
    }

    /// Origin-side bookkeeping plus the program sanity check.
    fn apply_own_status(&mut self, event: StatusEvent) {
        let program = event.thread_uid.program().clone();
        let Some(threads) = self.own_programs.get_mut(&program) else {
            // Already torn down; late updates are harmless.
            return;
        };
        threads.insert(event.thread_uid.thread(), event.status);

        match event.status {
            ThreadStatus::Crashed => {
                tracing::error!("program {program}: thread {} crashed", event.thread_uid);
                self.own_programs.remove(&program);
                self.teardown_program(&program);
            }
            ThreadStatus::Finished | ThreadStatus::Blocked => self.sanity_check(&program),
            _ => {}
        }
    }

    /// Declare completion when every thread finished; declare deadlock when
    /// every thread that is not finished is blocked with nothing
    /// deliverable. A locally-held blocked thread whose inbox already has
    /// the awaited message is about to wake, so it vetoes the verdict.
    fn sanity_check(&mut self, program: &ProgramId) {
        let Some(threads) = self.own_programs.get(program) else {
            return;
        };

        let total = threads.len();
        let mut finished = 0;
        let mut stuck = 0;
        for (thread, status) in threads {
            match status {
                ThreadStatus::Finished => finished += 1,
                ThreadStatus::Blocked => {
                    let uid = ThreadUid(program.clone(), *thread);
                    let deliverable = self
                        .programs
                        .get(program)
                        .and_then(|local| local.get(thread))
                        .and_then(|interp| interp.waiting_from())
                        .is_some_and(|from| self.comms.has_pending(from, &uid));
                    if deliverable {
                        return;
                    }
                    stuck += 1;
                }
                // Something still runs (or sleeps) somewhere: no verdict.
                _ => return,
            }
        }

        if finished == total {
            tracing::info!("program {program} finished");
            self.own_programs.remove(program);
            self.programs.remove(program);
        } else if stuck > 0 {
            tracing::error!("program {program} deadlocked: {stuck} blocked, {finished} finished");
            self.own_programs.remove(program);
            self.teardown_program(program);
        }
    }

    fn remove_thread(&mut self, uid: &ThreadUid) {
        if let Some(threads) = self.programs.get_mut(uid.program()) {
            threads.remove(&uid.thread());
            if threads.is_empty() {
                self.programs.remove(uid.program());
            }
        }
    }

    /// Drop every local interpreter of a program.
    fn teardown_program(&mut self, program: &ProgramId) {
        if self.programs.remove(program).is_some() {
            tracing::warn!("program {program} torn down");
        }
    }

    // ── Migration ────────────────────────────────────────────────────────────

    /// Pack a thread, ship it, and either let it go or restore it locally.
    ///
    /// Restoration is idempotent: the PC, stack and pending inbox are
    /// exactly as they were before the attempt.
    pub fn migrate_thread(
        &mut self,
        program: &ProgramId,
        thread: ThreadId,
        target: Option<RuntimeId>,
    ) -> Result<RuntimeId, RuntimeError> {
        let uid = ThreadUid(program.clone(), thread);
        let interpreter = self
            .programs
            .get_mut(program)
            .and_then(|threads| threads.remove(&thread))
            .ok_or_else(|| RuntimeError::NoSuchThread(uid.clone()))?;
        if self
            .programs
            .get(program)
            .is_some_and(|threads| threads.is_empty())
        {
            self.programs.remove(program);
        }

        let pending = self.comms.receive_all_messages(&uid);
        tracing::debug!("packed {} pending message queues", pending.len());
        let package = ThreadPackage::from_interpreter(interpreter, pending);
        let blob = package.pack()?;

        match self.comms.migrate_thread(uid.clone(), blob, target) {
            Ok(Some(acceptor)) => {
                tracing::info!("thread {uid} migrated to {acceptor}");
                Ok(acceptor)
            }
            outcome => {
                if let Err(e) = &outcome {
                    tracing::warn!("migration of {uid} failed: {e}");
                }
                let (interpreter, pending) = package.into_interpreter();
                self.comms.restore_messages(pending);
                self.comms.update_thread_location(uid.clone(), self.id.clone());
                self.programs
                    .entry(program.clone())
                    .or_default()
                    .insert(thread, interpreter);
                Err(RuntimeError::MigrationRefused)
            }
        }
    }

    /// A packed thread arrived over the network; resume it here.
    fn adopt_thread(&mut self, blob: &[u8]) -> Result<(), RuntimeError> {
        let package = ThreadPackage::unpack(blob)?;
        let uid = package.thread_uid();
        let (interpreter, pending) = package.into_interpreter();
        tracing::info!(
            "adopted thread {uid} (origin {}, {} pending queues)",
            interpreter.origin(),
            pending.len()
        );
        self.comms.restore_messages(pending);
        self.programs
            .entry(uid.program().clone())
            .or_default()
            .insert(uid.thread(), interpreter);
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Migrate every foreign-origin thread to whoever takes it, then stop
    /// the dispatch loop.
    fn shutdown(&mut self) {
        let foreign: Vec<(ProgramId, ThreadId)> = self
            .programs
            .iter()
            .flat_map(|(pid, threads)| {
                threads
                    .iter()
                    .filter(|(_, interp)| *interp.origin() != self.id)
                    .map(|(tid, _)| (pid.clone(), *tid))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (program, thread) in foreign {
            tracing::info!("getting rid of {program}:{thread}");
            if let Err(e) = self.migrate_thread(&program, thread, None) {
                tracing::warn!("cannot migrate {program}:{thread} away: {e}");
            }
        }
        self.running = false;
    }
}
