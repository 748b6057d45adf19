//! Property tests for the correlation registry and the subscription state
//! machine.

use marketlink::{
    CorrelationId, CorrelationRegistry, Event, EventKind, LoopbackTransport, Message,
    MessageType, OperationContext, OperationKind, Session, SessionOptions, SubscriptionList,
    SubscriptionPreprocessMode, SubscriptionState,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum RegistryOp {
    Register(i64),
    RegisterBatch(Vec<i64>),
    Release(i64),
    Silence(i64),
    Track(Vec<i64>),
    Settle(Vec<i64>),
}

fn registry_op() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (0i64..12).prop_map(RegistryOp::Register),
        prop::collection::vec(0i64..12, 1..4).prop_map(RegistryOp::RegisterBatch),
        (0i64..12).prop_map(RegistryOp::Release),
        (0i64..12).prop_map(RegistryOp::Silence),
        prop::collection::vec(0i64..12, 0..3).prop_map(RegistryOp::Track),
        prop::collection::vec(0i64..12, 0..3).prop_map(RegistryOp::Settle),
    ]
}

#[derive(Debug, Clone)]
enum SubscriptionOp {
    Subscribe(i64),
    Start(i64),
    Data(i64),
    Unsubscribe(i64),
    Terminate(i64),
}

fn subscription_op() -> impl Strategy<Value = SubscriptionOp> {
    (0i64..4).prop_flat_map(|id| {
        prop_oneof![
            Just(SubscriptionOp::Subscribe(id)),
            Just(SubscriptionOp::Start(id)),
            Just(SubscriptionOp::Data(id)),
            Just(SubscriptionOp::Unsubscribe(id)),
            Just(SubscriptionOp::Terminate(id)),
        ]
    })
}

fn ids(values: &[i64]) -> Vec<CorrelationId> {
    values.iter().copied().map(CorrelationId::from_int).collect()
}

fn status(message_type: MessageType, id: i64) -> Event {
    Event::new(
        EventKind::SubscriptionStatus,
        vec![Message::status(message_type, CorrelationId::from_int(id))],
    )
}

fn data_delivered(session: &Session) -> usize {
    let mut count = 0;
    while let Some(event) = session.try_next_event().unwrap() {
        if event.kind == EventKind::SubscriptionData {
            count += event.messages.len();
        }
    }
    count
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the registry agrees with a plain set model after any
    /// sequence of operations, and only ids with messages in flight stay
    /// silenced.
    #[test]
    fn prop_registry_matches_model(ops in prop::collection::vec(registry_op(), 1..80)) {
        let registry = CorrelationRegistry::new();
        let mut live: HashSet<i64> = HashSet::new();
        let mut silenced: HashSet<i64> = HashSet::new();
        let mut in_flight: HashMap<i64, usize> = HashMap::new();

        for op in &ops {
            match op {
                RegistryOp::Register(id) => {
                    let result = registry.register(OperationContext::new(
                        CorrelationId::from_int(*id),
                        OperationKind::Request,
                    ));
                    prop_assert_eq!(result.is_ok(), live.insert(*id));
                    if result.is_ok() {
                        silenced.remove(id);
                    }
                }
                RegistryOp::RegisterBatch(ids) => {
                    let distinct: HashSet<i64> = ids.iter().copied().collect();
                    let expect_ok = distinct.len() == ids.len()
                        && ids.iter().all(|id| !live.contains(id));
                    let contexts = ids
                        .iter()
                        .map(|id| OperationContext::new(
                            CorrelationId::from_int(*id),
                            OperationKind::Subscription,
                        ))
                        .collect();
                    prop_assert_eq!(registry.register_all(contexts).is_ok(), expect_ok);
                    if expect_ok {
                        for id in ids {
                            live.insert(*id);
                            silenced.remove(id);
                        }
                    }
                }
                RegistryOp::Release(id) => {
                    let released = registry.release(&CorrelationId::from_int(*id));
                    prop_assert_eq!(released.is_some(), live.remove(id));
                }
                RegistryOp::Silence(id) => {
                    registry.silence(&CorrelationId::from_int(*id));
                    if in_flight.contains_key(id) {
                        silenced.insert(*id);
                    }
                }
                RegistryOp::Track(values) => {
                    registry.track(&ids(values));
                    let distinct: HashSet<i64> = values.iter().copied().collect();
                    for id in distinct {
                        *in_flight.entry(id).or_insert(0) += 1;
                    }
                }
                RegistryOp::Settle(values) => {
                    let expect_deliver =
                        values.is_empty() || values.iter().any(|id| !silenced.contains(id));
                    prop_assert_eq!(registry.settle(&ids(values)), expect_deliver);
                    let distinct: HashSet<i64> = values.iter().copied().collect();
                    for id in distinct {
                        if let Some(count) = in_flight.get_mut(&id) {
                            *count -= 1;
                            if *count == 0 {
                                in_flight.remove(&id);
                                silenced.remove(&id);
                            }
                        }
                    }
                }
            }

            prop_assert!(silenced.iter().all(|id| in_flight.contains_key(id)));
            prop_assert_eq!(registry.silenced_len(), silenced.len());
            prop_assert_eq!(registry.len(), live.len());
            for id in 0..12 {
                let token = CorrelationId::from_int(id);
                prop_assert_eq!(registry.is_active(&token), live.contains(&id));
                prop_assert_eq!(registry.is_silenced(&token), silenced.contains(&id));
            }
        }
    }

    /// Property: subscription state, id ownership and data delivery follow
    /// the state machine for any sequence of calls and server events.
    #[test]
    fn prop_subscription_state_machine(ops in prop::collection::vec(subscription_op(), 1..40)) {
        let transport = Arc::new(LoopbackTransport::new());
        let session = Session::new(SessionOptions::default(), transport.clone(), None, None).unwrap();
        prop_assert!(session.start());
        session.next_event(Duration::from_millis(100)).unwrap();

        let mut model: HashMap<i64, SubscriptionState> = HashMap::new();

        for op in &ops {
            let mut expected_data = 0;
            match op {
                SubscriptionOp::Subscribe(id) => {
                    let mut list = SubscriptionList::new();
                    list.add(format!("TICKER{} US Equity", id), Some(CorrelationId::from_int(*id)));
                    let result = session.subscribe(
                        &list,
                        None,
                        "",
                        SubscriptionPreprocessMode::FailOnFirstError,
                    );
                    prop_assert_eq!(result.is_ok(), !model.contains_key(id));
                    model.entry(*id).or_insert(SubscriptionState::Subscribing);
                }
                SubscriptionOp::Start(id) => {
                    transport.deliver(status(MessageType::SubscriptionStarted, *id));
                    if let Some(state) = model.get_mut(id) {
                        if *state == SubscriptionState::Subscribing {
                            *state = SubscriptionState::Subscribed;
                        }
                    }
                }
                SubscriptionOp::Data(id) => {
                    transport.deliver(Event::new(
                        EventKind::SubscriptionData,
                        vec![Message::data(
                            "MarketDataEvents",
                            CorrelationId::from_int(*id),
                            json!({"LAST_PRICE": 1.0}),
                        )],
                    ));
                    if matches!(
                        model.get(id),
                        Some(SubscriptionState::Subscribing | SubscriptionState::Subscribed)
                    ) {
                        expected_data = 1;
                    }
                }
                SubscriptionOp::Unsubscribe(id) => {
                    let mut list = SubscriptionList::new();
                    list.add(format!("TICKER{} US Equity", id), Some(CorrelationId::from_int(*id)));
                    session.unsubscribe(&list).unwrap();
                    if let Some(state) = model.get_mut(id) {
                        *state = SubscriptionState::PendingCancellation;
                    }
                }
                SubscriptionOp::Terminate(id) => {
                    transport.deliver(status(MessageType::SubscriptionTerminated, *id));
                    model.remove(id);
                }
            }

            prop_assert_eq!(data_delivered(&session), expected_data);
            for id in 0..4 {
                let token = CorrelationId::from_int(id);
                prop_assert_eq!(session.subscription_state(&token), model.get(&id).copied());
                prop_assert_eq!(session.is_active(&token), model.contains_key(&id));
            }
        }
    }

    /// Property: a correlation id always maps to the same worker, within range.
    #[test]
    fn prop_partition_in_range(value in any::<i64>(), name in "[A-Z]{1,8}", workers in 1usize..16) {
        let int_id = CorrelationId::from_int(value);
        let name_id = CorrelationId::named(name);
        prop_assert!(int_id.partition(workers) < workers);
        prop_assert_eq!(int_id.partition(workers), int_id.clone().partition(workers));
        prop_assert!(name_id.partition(workers) < workers);
    }
}
