#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for the presence engine and directory.
//!
//! Uses proptest to verify:
//! 1. The engine never emits a transition to the state it is already in,
//!    and consecutive transitions chain (`next.from == prev.to`).
//! 2. Idle fires at most once per idle period.
//! 3. The local user's own updates never enter the directory.
//! 4. Push updates are last-arrival-wins; polled updates only move forward.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use copresence::presence::{ApplyOutcome, EngineOutput, PresenceDirectory, PresenceEngine};
use copresence_proto::ids::UserId;
use copresence_proto::presence::{Activity, PresenceStatus, PresenceUpdate};

const THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
enum Op {
    Open,
    Close,
    Input,
    Report(u8),
    CheckIdle,
    Dnd(bool),
    Advance(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Open),
        Just(Op::Close),
        Just(Op::Input),
        (0u8..3).prop_map(Op::Report),
        Just(Op::CheckIdle),
        any::<bool>().prop_map(Op::Dnd),
        (0u64..600).prop_map(Op::Advance),
    ]
}

fn arb_status() -> impl Strategy<Value = PresenceStatus> {
    prop_oneof![
        Just(PresenceStatus::Online),
        Just(PresenceStatus::Idle),
        Just(PresenceStatus::DoNotDisturb),
        Just(PresenceStatus::Offline),
    ]
}

fn arb_update() -> impl Strategy<Value = PresenceUpdate> {
    (prop_oneof![Just("alice"), Just("bob"), Just("carol")], arb_status(), 0u64..1_000).prop_map(
        |(user, status, at)| PresenceUpdate {
            user_id: UserId::new(user),
            status,
            activity: None,
            at,
        },
    )
}

proptest! {
    #[test]
    fn transitions_chain_without_repeats(ops in prop::collection::vec(arb_op(), 0..64)) {
        let mut engine = PresenceEngine::new(THRESHOLD);
        let start = Instant::now();
        let mut now = start;
        let mut last = PresenceStatus::Offline;

        for op in ops {
            let transition = match op {
                Op::Open => engine.session_opened(now),
                Op::Close => engine.session_closed(),
                Op::Input => engine.observe_input(now),
                Op::Report(n) => match engine.report_activity(Activity::kind_only(format!("k{n}")), now) {
                    Some(EngineOutput::Transition(t)) => Some(t),
                    Some(EngineOutput::ActivityChanged(_)) | None => None,
                },
                Op::CheckIdle => engine.check_idle(now),
                Op::Dnd(on) => engine.set_do_not_disturb(on, now),
                Op::Advance(secs) => {
                    now += Duration::from_secs(secs);
                    None
                }
            };
            if let Some(t) = transition {
                prop_assert_ne!(t.from, t.to);
                prop_assert_eq!(t.from, last);
                last = t.to;
            }
            prop_assert_eq!(engine.status(), last);
        }
    }

    #[test]
    fn idle_fires_once_per_period(checks in 1usize..20, gap in 0u64..120) {
        let mut engine = PresenceEngine::new(THRESHOLD);
        let mut now = Instant::now();
        engine.session_opened(now).unwrap();
        now += THRESHOLD;

        let mut fired = 0;
        for _ in 0..checks {
            if engine.check_idle(now).is_some() {
                fired += 1;
            }
            now += Duration::from_secs(gap);
        }
        prop_assert_eq!(fired, 1);
        prop_assert_eq!(engine.status(), PresenceStatus::Idle);
    }

    #[test]
    fn own_updates_never_enter_directory(updates in prop::collection::vec(arb_update(), 0..32)) {
        let mut directory = PresenceDirectory::new(UserId::new("alice"));
        for update in &updates {
            let outcome = directory.apply_incremental(update, 1);
            if update.user_id.as_str() == "alice" {
                prop_assert_eq!(outcome, ApplyOutcome::SelfEcho);
            }
            let polled = directory.apply_polled(update);
            if update.user_id.as_str() == "alice" {
                prop_assert_eq!(polled, ApplyOutcome::SelfEcho);
            }
        }
        prop_assert!(directory.get(&UserId::new("alice")).is_none());
    }

    #[test]
    fn push_is_last_arrival_wins(updates in prop::collection::vec(arb_update(), 1..32)) {
        let mut directory = PresenceDirectory::new(UserId::new("alice"));
        let mut expected: HashMap<UserId, PresenceStatus> = HashMap::new();
        for update in &updates {
            directory.apply_incremental(update, 1);
            if update.user_id.as_str() != "alice" {
                expected.insert(update.user_id.clone(), update.status);
            }
        }
        for (user, status) in expected {
            prop_assert_eq!(directory.get(&user).map(|e| e.status), Some(status));
        }
    }

    #[test]
    fn polling_only_moves_forward(updates in prop::collection::vec(arb_update(), 1..32)) {
        let mut directory = PresenceDirectory::new(UserId::new("alice"));
        let mut newest: HashMap<UserId, u64> = HashMap::new();
        for update in &updates {
            if update.user_id.as_str() == "alice" {
                continue;
            }
            let outcome = directory.apply_polled(update);
            let seen = newest.get(&update.user_id).copied();
            if seen.is_none_or(|at| update.at > at) {
                prop_assert_eq!(outcome, ApplyOutcome::Applied);
                newest.insert(update.user_id.clone(), update.at);
            } else {
                prop_assert_eq!(outcome, ApplyOutcome::Stale);
            }
        }
        for (user, at) in newest {
            prop_assert_eq!(directory.get(&user).map(|e| e.observed_at), Some(at));
        }
    }
}
