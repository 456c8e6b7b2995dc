// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Interpreter behaviour tests over an in-memory message port.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use gridvm_proto::{ProgramId, RuntimeId, ThreadStatus, ThreadUid};
use gridvm_vm::compile::compile;
use gridvm_vm::{Interpreter, MessagePort, SendError, StepResult, Value};

// ── In-memory port ────────────────────────────────────────────────────────────

#[derive(Default)]
struct LoopbackPort {
    queues: RefCell<HashMap<(ThreadUid, ThreadUid), VecDeque<Value>>>,
    prints: RefCell<Vec<(ThreadUid, String)>>,
}

impl MessagePort for LoopbackPort {
    fn send_message(
        &self,
        recv: ThreadUid,
        sender: ThreadUid,
        msg: Value,
    ) -> Result<(), SendError> {
        self.queues
            .borrow_mut()
            .entry((recv, sender))
            .or_default()
            .push_back(msg);
        Ok(())
    }

    fn receive_message(&self, sender: ThreadUid, recv: ThreadUid) -> Option<Value> {
        self.queues
            .borrow_mut()
            .get_mut(&(recv, sender))
            .and_then(|q| q.pop_front())
    }

    fn send_print(&self, _origin: &RuntimeId, thread: ThreadUid, text: String) {
        self.prints.borrow_mut().push((thread, text));
    }
}

fn interpreter(source: &str, thread: u32, argv: &[i64]) -> Interpreter {
    let code = compile(source).expect("compile");
    let mut interp = Interpreter::new(
        RuntimeId::derive("test-runtime"),
        ProgramId::derive("/programs/test.mtss"),
        thread,
        code,
    );
    let mut full_argv = vec![thread as i64];
    full_argv.extend_from_slice(argv);
    interp.start(&full_argv);
    interp
}

/// Step until the interpreter stops making progress; panics on crash.
fn run_to_end(interp: &mut Interpreter, port: &LoopbackPort) {
    for _ in 0..10_000 {
        match interp.step(port) {
            StepResult::Continued => {}
            StepResult::Finished => return,
            other => panic!("unexpected step result {other:?}"),
        }
    }
    panic!("interpreter did not finish");
}

// ── Basic execution ───────────────────────────────────────────────────────────

#[test]
fn arithmetic_loop_counts_down() {
    let port = LoopbackPort::default();
    let mut t = interpreter(
        "#SIMPLESCRIPT\n\
         SET $n 5\n\
         SET $sum 0\n\
         LOOP ADD $sum $sum $n\n\
         SUB $n $n 1\n\
         BGT $n 0 LOOP\n\
         PRN \"sum is \" $sum\n\
         RET\n",
        0,
        &[],
    );
    run_to_end(&mut t, &port);
    assert_eq!(t.status(), ThreadStatus::Finished);
    assert_eq!(port.prints.borrow()[0].1, "sum is 15");
}

#[test]
fn argv_is_visible_as_array_zero() {
    let port = LoopbackPort::default();
    let mut t = interpreter(
        "#SIMPLESCRIPT\n\
         PRN \"tid=\" $argv[0]\n\
         PRN \"argc=\" $argc\n\
         PRN \"first=\" $argv[1]\n\
         RET\n",
        3,
        &[99],
    );
    run_to_end(&mut t, &port);
    let prints = port.prints.borrow();
    assert_eq!(prints[0].1, "tid=3");
    assert_eq!(prints[1].1, "argc=2");
    assert_eq!(prints[2].1, "first=99");
}

#[test]
fn arrays_support_sparse_indices() {
    let port = LoopbackPort::default();
    let mut t = interpreter(
        "#SIMPLESCRIPT\n\
         SET $a[100] 1\n\
         SET $a[-5] 2\n\
         ADD $r $a[100] $a[-5]\n\
         PRN \"r=\" $r\n\
         RET\n",
        0,
        &[],
    );
    run_to_end(&mut t, &port);
    assert_eq!(port.prints.borrow()[0].1, "r=3");
}

#[test]
fn print_joins_values_in_push_order() {
    let port = LoopbackPort::default();
    let mut t = interpreter("#SIMPLESCRIPT\nPRN \"vals \" 1 2 3\nRET\n", 0, &[]);
    run_to_end(&mut t, &port);
    assert_eq!(port.prints.borrow()[0].1, "vals 1, 2, 3");
}

// ── Messaging ─────────────────────────────────────────────────────────────────

#[test]
fn send_then_receive_round_trip() {
    let port = LoopbackPort::default();
    // Thread 0 sends 42 to thread 1 and finishes.
    let mut t0 = interpreter("#SIMPLESCRIPT\nSET $x 42\nSND 1 $x\nRET\n", 0, &[]);
    run_to_end(&mut t0, &port);

    // Thread 1 receives from thread 0 and prints.
    let mut t1 = interpreter("#SIMPLESCRIPT\nRCV 0 $y\nPRN \"got \" $y\nRET\n", 1, &[]);
    run_to_end(&mut t1, &port);
    assert_eq!(port.prints.borrow()[0].1, "got 42");
}

#[test]
fn rcv_blocks_and_retries_at_the_same_pc() {
    let port = LoopbackPort::default();
    let mut t1 = interpreter("#SIMPLESCRIPT\nRCV 0 $y\nPRN \"got \" $y\nRET\n", 1, &[]);

    // Run up to the RCV: with an empty inbox it blocks without advancing
    // the PC, and the sender id goes back on top of the stack.
    while t1.step(&port) == StepResult::Continued {}
    assert_eq!(t1.status(), ThreadStatus::Blocked);
    let pc_blocked = t1.pc();
    assert_eq!(t1.stack().last(), Some(&Value::Int(0)));
    assert_eq!(
        t1.waiting_from(),
        Some(&ThreadUid(ProgramId::derive("/programs/test.mtss"), 0))
    );

    // A spurious wake re-runs the same instruction and blocks again.
    t1.wake();
    assert_eq!(t1.step(&port), StepResult::Blocked);
    assert_eq!(t1.pc(), pc_blocked);
    assert_eq!(t1.stack().last(), Some(&Value::Int(0)));

    // A message arrives; the same instruction retries and consumes it.
    let mut t0 = interpreter("#SIMPLESCRIPT\nSND 1 42\nRET\n", 0, &[]);
    run_to_end(&mut t0, &port);

    t1.wake();
    run_to_end(&mut t1, &port);
    assert_eq!(port.prints.borrow()[0].1, "got 42");
}

#[test]
fn messages_are_fifo_per_pair() {
    let port = LoopbackPort::default();
    let mut t0 = interpreter(
        "#SIMPLESCRIPT\nSND 1 10\nSND 1 20\nSND 1 30\nRET\n",
        0,
        &[],
    );
    run_to_end(&mut t0, &port);

    let mut t1 = interpreter(
        "#SIMPLESCRIPT\n\
         RCV 0 $a\nRCV 0 $b\nRCV 0 $c\n\
         PRN \"order \" $a $b $c\nRET\n",
        1,
        &[],
    );
    run_to_end(&mut t1, &port);
    assert_eq!(port.prints.borrow()[0].1, "order 10, 20, 30");
}

// ── Sleep / crash ─────────────────────────────────────────────────────────────

#[test]
fn slp_advances_pc_and_sets_deadline() {
    let port = LoopbackPort::default();
    let mut t = interpreter("#SIMPLESCRIPT\nSLP 1\nRET\n", 0, &[]);

    // SET-less program: the literal 1 is a const load, then SLP.
    assert_eq!(t.step(&port), StepResult::Continued);
    let result = t.step(&port);
    assert!(matches!(result, StepResult::Sleeping(_)));
    assert_eq!(t.status(), ThreadStatus::Sleeping);
    assert!(t.wake_up_at().is_some());

    // Sleep runs exactly once: the PC moved past the SLP.
    t.wake();
    assert!(matches!(t.step(&port), StepResult::Finished));
}

#[test]
fn division_by_zero_crashes_the_thread() {
    let port = LoopbackPort::default();
    let mut t = interpreter("#SIMPLESCRIPT\nSET $z 0\nDIV $r 1 $z\nRET\n", 0, &[]);
    loop {
        match t.step(&port) {
            StepResult::Continued => {}
            StepResult::Crashed(reason) => {
                assert!(reason.contains("division by zero"), "reason: {reason}");
                break;
            }
            other => panic!("unexpected step result {other:?}"),
        }
    }
    assert_eq!(t.status(), ThreadStatus::Crashed);
}

#[test]
fn running_past_the_end_crashes() {
    let port = LoopbackPort::default();
    let mut t = interpreter("#SIMPLESCRIPT\nSET $x 1\n", 0, &[]);
    loop {
        match t.step(&port) {
            StepResult::Continued => {}
            StepResult::Crashed(reason) => {
                assert!(reason.contains("RET"), "reason: {reason}");
                break;
            }
            other => panic!("unexpected step result {other:?}"),
        }
    }
}

// ── Save / load ───────────────────────────────────────────────────────────────

#[test]
fn save_load_is_idempotent_mid_run() {
    let port = LoopbackPort::default();
    let mut t = interpreter(
        "#SIMPLESCRIPT\n\
         SET $n 3\n\
         SET $a[0] 7\n\
         LOOP SUB $n $n 1\n\
         BGT $n 0 LOOP\n\
         RCV 0 $y\n\
         RET\n",
        1,
        &[],
    );

    // Run into the blocked RCV so every state component is populated.
    while t.step(&port) == StepResult::Continued {}
    assert_eq!(t.status(), ThreadStatus::Blocked);

    let saved = t.save_state();
    let mut restored = Interpreter::new(
        RuntimeId::derive("other-runtime"),
        ProgramId::derive("/programs/test.mtss"),
        1,
        t.code().clone(),
    );
    restored.load_state(saved.clone());

    assert_eq!(restored.save_state(), saved);
    assert_eq!(restored.pc(), t.pc());
    assert_eq!(restored.status(), ThreadStatus::Blocked);
    assert_eq!(restored.waiting_from(), t.waiting_from());

    // The restored interpreter resumes: deliver the message and finish.
    let mut t0 = interpreter("#SIMPLESCRIPT\nSND 1 5\nRET\n", 0, &[]);
    run_to_end(&mut t0, &port);
    restored.wake();
    run_to_end(&mut restored, &port);
    assert_eq!(restored.status(), ThreadStatus::Finished);
}

#[test]
fn state_survives_cbor_round_trip() {
    let port = LoopbackPort::default();
    let mut t = interpreter("#SIMPLESCRIPT\nSET $x 42\nSET $a[2] 9\nRCV 0 $y\nRET\n", 0, &[]);
    while t.step(&port) == StepResult::Continued {}

    let state = t.save_state();
    let mut bytes = Vec::new();
    ciborium::into_writer(&state, &mut bytes).unwrap();
    let back: gridvm_vm::InterpreterState = ciborium::from_reader(&bytes[..]).unwrap();
    assert_eq!(back, state);
}
