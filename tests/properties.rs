//! Property tests for merging, ordering, backfill and load progress.

use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tapedeck::{
    merge_subscriptions, CancellationToken, ManualClock, MemorySource, MessageEvent,
    PlaybackCore, PlayerConfig, PlayerState, PreloadType, SubscribePayload, SubscriberId, Time,
};

fn arb_payload() -> impl Strategy<Value = SubscribePayload> {
    (
        prop::sample::select(vec!["/a", "/b", "/c"]),
        prop::option::of(prop::collection::vec(
            prop::sample::select(vec!["x", "y", "z"]),
            0..3,
        )),
        any::<bool>(),
    )
        .prop_map(|(topic, fields, full)| SubscribePayload {
            topic: topic.to_string(),
            fields: fields.map(|f| f.into_iter().map(str::to_string).collect()),
            preload_type: if full { PreloadType::Full } else { PreloadType::Partial },
        })
}

fn arb_subscriptions() -> impl Strategy<Value = HashMap<SubscriberId, Vec<SubscribePayload>>> {
    prop::collection::hash_map(
        (0u64..8).prop_map(SubscriberId),
        prop::collection::vec(arb_payload(), 0..4),
        0..6,
    )
}

/// Union-reduction computed the slow way.
fn reduce(subscriptions: &HashMap<SubscriberId, Vec<SubscribePayload>>) -> Vec<SubscribePayload> {
    let mut topics: BTreeMap<String, Vec<&SubscribePayload>> = BTreeMap::new();
    for payload in subscriptions.values().flatten() {
        topics.entry(payload.topic.clone()).or_default().push(payload);
    }
    topics
        .into_iter()
        .map(|(topic, payloads)| {
            let full = payloads.iter().any(|p| p.preload_type == PreloadType::Full);
            let fields = if payloads.iter().any(|p| p.fields.is_none()) {
                None
            } else {
                let union: BTreeSet<String> = payloads
                    .iter()
                    .flat_map(|p| p.fields.iter().flatten().cloned())
                    .collect();
                Some(union.into_iter().collect())
            };
            SubscribePayload {
                topic,
                fields,
                preload_type: if full { PreloadType::Full } else { PreloadType::Partial },
            }
        })
        .collect()
}

fn drive_log(seconds: u32) -> MemorySource {
    let mut messages = Vec::new();
    for i in 0..seconds * 10 {
        let t = Time::new(i / 10, (i % 10) * 100_000_000);
        messages.push(MessageEvent::new("/a", "A", t, json!({"i": i})));
    }
    for i in 0..seconds * 3 {
        let t = Time::from_nanos(i as u64 * 333_000_000 + 10_000_000);
        messages.push(MessageEvent::new("/b", "B", t, json!({"i": i})));
    }
    MemorySource::new(messages).with_bounds(Time::ZERO, Time::new(seconds, 0))
}

#[derive(Clone, Debug)]
enum Op {
    Advance(u64),
    Seek(u64),
    Speed(f64),
    Start,
    Pause,
    ToggleB(bool),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..400).prop_map(Op::Advance),
        1 => (0u64..25_000).prop_map(Op::Seek),
        1 => (0.25f64..4.0).prop_map(Op::Speed),
        1 => Just(Op::Start),
        1 => Just(Op::Pause),
        1 => any::<bool>().prop_map(Op::ToggleB),
    ]
}

/// Apply `op` and collect whatever the core emits.
fn run_op(
    core: &mut PlaybackCore,
    clock: &ManualClock,
    subscriptions: &mut Vec<SubscribePayload>,
    op: &Op,
) -> Vec<PlayerState> {
    let cancel = CancellationToken::new();
    let mut states = Vec::new();
    match op {
        Op::Advance(ms) => {
            clock.advance(Duration::from_millis(*ms));
            states.extend(core.step(&cancel).state);
        }
        Op::Seek(ms) => core.seek(Time::from_nanos(ms * 1_000_000), &cancel).unwrap(),
        Op::Speed(speed) => core.set_speed(*speed).unwrap(),
        Op::Start => core.start(&cancel).unwrap(),
        Op::Pause => core.pause().unwrap(),
        Op::ToggleB(on) => {
            subscriptions.retain(|p| p.topic != "/b");
            if *on {
                subscriptions.push(SubscribePayload::partial("/b"));
            }
            core.set_subscriptions(subscriptions.clone(), &cancel).unwrap();
        }
    }
    states.extend(core.emit());
    states
}

fn ready_core(subscriptions: &[SubscribePayload], config: PlayerConfig) -> (PlaybackCore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let mut core = PlaybackCore::new(Box::new(drive_log(20)), config, clock.clone());
    let cancel = CancellationToken::new();
    core.initialize(&cancel).unwrap();
    core.set_subscriptions(subscriptions.to_vec(), &cancel).unwrap();
    (core, clock)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn merge_is_union_reduction(subscriptions in arb_subscriptions()) {
        prop_assert_eq!(merge_subscriptions(&subscriptions), reduce(&subscriptions));
    }

    #[test]
    fn merge_ignores_subscriber_order(payloads in prop::collection::vec(arb_payload(), 0..10)) {
        let forward: HashMap<_, _> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| (SubscriberId(i as u64), vec![p.clone()]))
            .collect();
        let reversed: HashMap<_, _> = payloads
            .iter()
            .rev()
            .enumerate()
            .map(|(i, p)| (SubscriberId(i as u64), vec![p.clone()]))
            .collect();
        prop_assert_eq!(merge_subscriptions(&forward), merge_subscriptions(&reversed));
    }

    #[test]
    fn delivery_is_ordered_within_each_seek_epoch(ops in prop::collection::vec(arb_op(), 1..60)) {
        let mut subscriptions = vec![SubscribePayload::partial("/a")];
        let (mut core, clock) = ready_core(&subscriptions, PlayerConfig::default());

        let mut epoch = None;
        let mut last: Option<Time> = None;
        let mut states: Vec<PlayerState> = core.emit().into_iter().collect();
        for op in &ops {
            states.extend(run_op(&mut core, &clock, &mut subscriptions, op));
        }

        for state in &states {
            let Some(data) = &state.active_data else { continue };
            if epoch != Some(data.last_seek_time) {
                epoch = Some(data.last_seek_time);
                last = None;
            }
            prop_assert!(data.current_time >= data.start_time && data.current_time <= data.end_time);
            for message in data.messages.iter() {
                prop_assert!(last.map_or(true, |t| t <= message.receive_time));
                prop_assert!(message.receive_time <= data.current_time);
                last = Some(message.receive_time);
            }
        }
    }

    #[test]
    fn seek_backfills_latest_per_topic(
        a_times in prop::collection::vec(0u64..10_000, 1..30),
        b_times in prop::collection::vec(0u64..10_000, 1..30),
        target in 0u64..10_000,
    ) {
        let mut messages = Vec::new();
        for ms in &a_times {
            messages.push(MessageEvent::new("/a", "A", Time::from_nanos(ms * 1_000_000), json!({})));
        }
        for ms in &b_times {
            messages.push(MessageEvent::new("/b", "B", Time::from_nanos(ms * 1_000_000), json!({})));
        }
        let source = MemorySource::new(messages).with_bounds(Time::ZERO, Time::new(10, 0));
        let clock = Arc::new(ManualClock::new());
        let mut core = PlaybackCore::new(Box::new(source), PlayerConfig::default(), clock);
        let cancel = CancellationToken::new();
        core.initialize(&cancel).unwrap();
        core.set_subscriptions(
            vec![SubscribePayload::partial("/a"), SubscribePayload::partial("/b")],
            &cancel,
        )
        .unwrap();
        core.emit();

        let t = Time::from_nanos(target * 1_000_000);
        core.seek(t, &cancel).unwrap();
        let data = core.emit().unwrap().active_data.unwrap();

        let latest = |times: &[u64]| times.iter().filter(|ms| **ms <= target).max().copied();
        for (topic, times) in [("/a", &a_times), ("/b", &b_times)] {
            let got: Vec<Time> = data
                .messages
                .iter()
                .filter(|m| m.topic == topic)
                .map(|m| m.receive_time)
                .collect();
            let expected: Vec<Time> = latest(times)
                .map(|ms| Time::from_nanos(ms * 1_000_000))
                .into_iter()
                .collect();
            prop_assert_eq!(got, expected);
        }
        prop_assert!(data.messages.windows(2).all(|w| w[0].receive_time <= w[1].receive_time));
    }

    #[test]
    fn progress_only_grows(
        ops in prop::collection::vec(arb_op(), 1..80),
        small_cache in any::<bool>(),
    ) {
        let config = PlayerConfig {
            cache_ceiling_bytes: if small_cache { 2_048 } else { 64 * 1024 * 1024 },
            read_ahead: Duration::from_secs(1),
            ..Default::default()
        };
        let mut subscriptions = vec![SubscribePayload::full("/a")];
        let (mut core, clock) = ready_core(&subscriptions, config);

        let mut previous: Option<PlayerState> = core.emit();
        for op in &ops {
            // Keep the full-preload set fixed; toggling /b (partial) is fine.
            for state in run_op(&mut core, &clock, &mut subscriptions, op) {
                if let Some(before) = &previous {
                    prop_assert!(state.progress.covers(&before.progress));
                }
                previous = Some(state);
            }
        }
    }
}
