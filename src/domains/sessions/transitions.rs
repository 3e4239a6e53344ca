use std::collections::HashMap;

use crate::domains::sessions::entity::{Session, TaskStatus, ThreadType};
use crate::shared::state_machine::{StateMachine, TransitionOutcome};

/// Machine governing which thread-type changes a session may make.
pub fn thread_type_machine() -> StateMachine<ThreadType> {
    use ThreadType::*;
    let transitions = HashMap::from([
        (Base, vec![Parallel, Big, Long]),
        (Parallel, vec![Base, Fusion, Chained]),
        (Chained, vec![Parallel, Fusion]),
        (Fusion, vec![Base]),
        (Big, vec![Parallel, Fusion]),
        (Long, vec![Base, Parallel]),
    ]);
    build("thread_type", vec![Base, Parallel, Chained, Fusion, Big, Long], transitions, Base)
}

/// Machine for task statuses; `archived` is terminal. The task feature
/// itself lives outside this crate; only the machine is provided here.
pub fn task_status_machine() -> StateMachine<TaskStatus> {
    use TaskStatus::*;
    let transitions = HashMap::from([
        (Ready, vec![InProgress, Blocked, Archived]),
        (InProgress, vec![InReview, Blocked, Ready]),
        (InReview, vec![Completed, InProgress, Blocked]),
        (Blocked, vec![Ready, InProgress]),
        (Completed, vec![Archived]),
        (Archived, vec![]),
    ]);
    build(
        "task_status",
        vec![Ready, InProgress, InReview, Blocked, Completed, Archived],
        transitions,
        Ready,
    )
}

fn build<S: Copy + Eq + std::hash::Hash + std::fmt::Display>(
    name: &'static str,
    states: Vec<S>,
    transitions: HashMap<S, Vec<S>>,
    initial: S,
) -> StateMachine<S> {
    match StateMachine::new(name, states, transitions, initial) {
        Ok(machine) => machine,
        // Both tables are static; a bad one is a bug in this module.
        Err(err) => unreachable!("builtin state machine '{name}' misconfigured: {err}"),
    }
}

/// Applies a thread-type transition to a session, updating it only when the
/// machine sanctions the move (or the caller forces it).
pub fn transition_thread_type(
    machine: &StateMachine<ThreadType>,
    session: &mut Session,
    to: ThreadType,
    force: bool,
) -> TransitionOutcome<ThreadType> {
    let outcome = machine.transition(session.thread_type, to, force);
    if outcome.success && !outcome.noop {
        session.thread_type = to;
    }
    outcome
}
