// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Single-node scheduler scenarios: echo, blocking, deadlock, completion
//! and migration pack/restore, driven tick by tick against a bus with a
//! scripted net handler.

use std::fs;
use std::path::{Path, PathBuf};

use gridvm_comms::{CommsBus, OutboundReceiver};
use gridvm_proto::{PacketKind, ProgramId, RuntimeId};
use gridvm_runtime::{Runtime, RuntimeError, ThreadPackage};

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// A two-thread echo program: T0 sends 42 to T1, T1 prints what it got.
fn echo_program(dir: &Path) -> PathBuf {
    write_file(
        dir,
        "t0.ss",
        "#SIMPLESCRIPT\nSET $x 42\nSND 1 $x\nRET\n",
    );
    write_file(
        dir,
        "t1.ss",
        "#SIMPLESCRIPT\nRCV 0 $y\nPRN \"got \" $y\nRET\n",
    );
    write_file(
        dir,
        "echo.mtss",
        "#SIMPLESCRIPT_MULTITHREADED 2\n#THREAD \"t0.ss\"\n#THREAD \"t1.ss\"\n",
    )
}

fn ticks(runtime: &mut Runtime, n: usize) {
    for _ in 0..n {
        runtime.tick();
    }
}

#[test]
fn echo_program_completes_and_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (comms, _net) = CommsBus::new(RuntimeId::derive("solo"));
    let (mut runtime, _handle) = Runtime::new(comms);

    let pid = runtime.load_program(&echo_program(dir.path())).unwrap();
    assert_eq!(runtime.program_listing().len(), 1);

    ticks(&mut runtime, 50);

    // Both threads FINISHED: the program is gone from the local table
    // (origin bookkeeping removed it within a tick of the last FINISH).
    assert!(
        runtime.program_listing().is_empty(),
        "completed program must be dropped"
    );
    let _ = pid;
}

#[test]
fn receiver_blocks_until_the_send_lands() {
    let dir = tempfile::tempdir().unwrap();
    // T0 receives first; T1 sleeps briefly before sending, so the RCV
    // always runs on an empty inbox and must block.
    write_file(
        dir.path(),
        "recv.ss",
        "#SIMPLESCRIPT\nRCV 1 $y\nPRN \"late \" $y\nRET\n",
    );
    write_file(
        dir.path(),
        "send.ss",
        "#SIMPLESCRIPT\nSLP 0\nSND 0 7\nRET\n",
    );
    let mtss = write_file(
        dir.path(),
        "blocked.mtss",
        "#SIMPLESCRIPT_MULTITHREADED 2\n#THREAD \"recv.ss\"\n#THREAD \"send.ss\"\n",
    );

    let (comms, _net) = CommsBus::new(RuntimeId::derive("solo"));
    let (mut runtime, _handle) = Runtime::new(comms);
    runtime.load_program(&mtss).unwrap();

    // No deadlock is declared while the sender is alive, the receiver is
    // woken by the delivery, and everything completes.
    ticks(&mut runtime, 50);
    assert!(runtime.program_listing().is_empty());
}

#[test]
fn mutual_receive_is_declared_deadlocked_and_torn_down() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a.ss", "#SIMPLESCRIPT\nRCV 1 $x\nRET\n");
    write_file(dir.path(), "b.ss", "#SIMPLESCRIPT\nRCV 0 $y\nRET\n");
    let mtss = write_file(
        dir.path(),
        "dead.mtss",
        "#SIMPLESCRIPT_MULTITHREADED 2\n#THREAD \"a.ss\"\n#THREAD \"b.ss\"\n",
    );

    let (comms, _net) = CommsBus::new(RuntimeId::derive("solo"));
    let (mut runtime, _handle) = Runtime::new(comms);
    runtime.load_program(&mtss).unwrap();

    ticks(&mut runtime, 20);

    assert!(
        runtime.program_listing().is_empty(),
        "deadlocked program must be torn down within finite ticks"
    );
}

#[test]
fn crash_tears_down_the_whole_program() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "boom.ss", "#SIMPLESCRIPT\nSET $z 0\nDIV $r 1 $z\nRET\n");
    write_file(dir.path(), "spin.ss", "#SIMPLESCRIPT\nLFOREVER BRA LFOREVER\nRET\n");
    let mtss = write_file(
        dir.path(),
        "crash.mtss",
        "#SIMPLESCRIPT_MULTITHREADED 2\n#THREAD \"boom.ss\"\n#THREAD \"spin.ss\"\n",
    );

    let (comms, _net) = CommsBus::new(RuntimeId::derive("solo"));
    let (mut runtime, _handle) = Runtime::new(comms);
    runtime.load_program(&mtss).unwrap();

    ticks(&mut runtime, 20);

    // The spinner is gone too, even though it never faulted itself.
    assert!(runtime.program_listing().is_empty());
}

// ── Migration ─────────────────────────────────────────────────────────────────

/// Run a scripted net handler beside the scheduler: answer the next
/// MIGRATE_THREAD on the outbound queue with the given outcome, returning
/// the shipped package blob.
fn scripted_migration_ack(
    comms: CommsBus,
    mut outbound: OutboundReceiver,
    outcome: Option<RuntimeId>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || loop {
        match outbound.try_recv() {
            Ok((_, packet)) if packet.kind == PacketKind::MigrateThread => {
                comms.migrate_thread_completed(outcome.clone());
                return packet.payload;
            }
            Ok(_) => {}
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(5)),
        }
    })
}

/// Thread 0 spins forever (keeping the program live); thread 1 blocks in a
/// RCV from thread 0, the migration candidate.
fn single_blocked_thread(dir: &Path) -> PathBuf {
    write_file(dir, "spin.ss", "#SIMPLESCRIPT\nLLOOP BRA LLOOP\nRET\n");
    write_file(dir, "wait.ss", "#SIMPLESCRIPT\nSET $x 41\nRCV 0 $y\nRET\n");
    write_file(
        dir,
        "single.mtss",
        "#SIMPLESCRIPT_MULTITHREADED 2\n#THREAD \"spin.ss\"\n#THREAD \"wait.ss\"\n",
    )
}

#[test]
fn successful_migration_removes_the_thread_and_updates_forwarding() {
    let dir = tempfile::tempdir().unwrap();
    let (comms, outbound) = CommsBus::new(RuntimeId::derive("here"));
    let (mut runtime, _handle) = Runtime::new(comms.clone());
    let pid = runtime.load_program(&single_blocked_thread(dir.path())).unwrap();

    // Let both threads run into their blocked RCVs.
    ticks(&mut runtime, 10);

    let remote = RuntimeId::derive("there");
    let net = scripted_migration_ack(comms.clone(), outbound, Some(remote.clone()));
    let accepted = runtime.migrate_thread(&pid, 1, None).unwrap();
    let blob = net.join().unwrap();

    assert_eq!(accepted, remote);
    let uid = gridvm_proto::ThreadUid(pid.clone(), 1);
    assert_eq!(comms.location_of(&uid), Some(remote));
    assert_eq!(
        runtime.program_listing(),
        vec![(pid.clone(), vec![0])],
        "only thread 0 remains local"
    );

    // The shipped package resumes exactly where the thread stopped:
    // blocked in the RCV, sender id back on the stack.
    let package = ThreadPackage::unpack(&blob).unwrap();
    assert_eq!(package.thread_id, 1);
    let (interp, _) = package.into_interpreter();
    assert_eq!(interp.status(), gridvm_proto::ThreadStatus::Blocked);
    assert!(interp.waiting_from().is_some());
}

#[test]
fn refused_migration_restores_the_thread_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (comms, outbound) = CommsBus::new(RuntimeId::derive("here"));
    let (mut runtime, _handle) = Runtime::new(comms.clone());
    let pid = runtime.load_program(&single_blocked_thread(dir.path())).unwrap();
    ticks(&mut runtime, 10);

    let net = scripted_migration_ack(comms.clone(), outbound, None);
    let result = runtime.migrate_thread(&pid, 1, Some(RuntimeId::derive("busy")));
    net.join().unwrap();

    assert!(matches!(result, Err(RuntimeError::MigrationRefused)));
    assert_eq!(
        runtime.program_listing(),
        vec![(pid.clone(), vec![0, 1])],
        "the thread must be back after a NACK"
    );
    let uid = gridvm_proto::ThreadUid(pid, 1);
    assert_eq!(comms.location_of(&uid), Some(RuntimeId::derive("here")));
}

#[test]
fn migrating_a_missing_thread_is_an_error() {
    let (comms, _outbound) = CommsBus::new(RuntimeId::derive("here"));
    let (mut runtime, _handle) = Runtime::new(comms);
    let result = runtime.migrate_thread(&ProgramId::derive("/ghost"), 0, None);
    assert!(matches!(result, Err(RuntimeError::NoSuchThread(_))));
}

// ── Adoption of migrated threads ──────────────────────────────────────────────

#[test]
fn adopted_thread_resumes_and_completes_here() {
    let dir = tempfile::tempdir().unwrap();

    // Build a blocked thread on the "origin" node.
    let (origin_comms, origin_outbound) = CommsBus::new(RuntimeId::derive("origin"));
    let (mut origin_rt, _h1) = Runtime::new(origin_comms.clone());
    let pid = origin_rt.load_program(&single_blocked_thread(dir.path())).unwrap();
    ticks(&mut origin_rt, 10);

    let remote_id = RuntimeId::derive("adopter");
    let net = scripted_migration_ack(origin_comms.clone(), origin_outbound, Some(remote_id.clone()));
    origin_rt.migrate_thread(&pid, 1, None).unwrap();
    let blob = net.join().unwrap();

    // Hand the blob to the adopting node the way its net handler would.
    let (adopt_comms, _adopt_outbound) = CommsBus::new(remote_id);
    let (mut adopter, _h2) = Runtime::new(adopt_comms.clone());
    let uid = gridvm_proto::ThreadUid(pid.clone(), 1);
    adopt_comms.add_thread_migration(uid.clone(), blob);

    adopter.tick();
    assert_eq!(adopter.program_listing(), vec![(pid.clone(), vec![1])]);
    assert_eq!(adopt_comms.location_of(&uid), Some(adopt_comms.runtime_id().clone()));

    // Deliver the message it was blocked on; the thread finishes here.
    adopt_comms.add_thread_message(
        uid.clone(),
        gridvm_proto::ThreadUid(pid.clone(), 0),
        gridvm_vm::Value::Int(9),
    );
    ticks(&mut adopter, 10);
    assert!(adopter.program_listing().is_empty(), "thread finished after unblocking");
}
