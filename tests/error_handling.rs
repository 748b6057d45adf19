//! Error handling tests: invalid arguments, invalid state and rollback of
//! rejected operations.

use marketlink::{
    CorrelationId, Event, EventDispatcherConfig, EventKind, LoopbackTransport, Message,
    MessageType, Operation, PreprocessErrorCode, Request, Service, Session, SessionError,
    SessionOptions, SubscriptionList, SubscriptionPreprocessMode, SubscriptionState,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(200);

fn started_session() -> (Session, Arc<LoopbackTransport>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(LoopbackTransport::new());
    let session = Session::new(SessionOptions::default(), transport.clone(), None, None).unwrap();
    assert!(session.start());
    session.next_event(WAIT).unwrap();
    (session, transport)
}

// --- Construction ---

#[test]
fn test_dispatcher_requires_handler() {
    let result = Session::new(
        SessionOptions::default(),
        Arc::new(LoopbackTransport::new()),
        None,
        Some(EventDispatcherConfig { num_threads: 2 }),
    );
    match result {
        Err(SessionError::InvalidArgument(message)) => {
            assert!(message.contains("event handler"));
        }
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn test_zero_dispatcher_threads_rejected() {
    let result = Session::with_handler(
        SessionOptions::default(),
        Arc::new(LoopbackTransport::new()),
        Some(EventDispatcherConfig { num_threads: 0 }),
        |_: &Event, _: &Session| {},
    );
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
}

#[test]
fn test_invalid_default_service_rejected() {
    let options = SessionOptions {
        default_subscription_service: "mktdata".to_string(),
        ..Default::default()
    };
    let result = Session::new(options, Arc::new(LoopbackTransport::new()), None, None);
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
}

#[test]
fn test_unsupported_preprocess_mode() {
    assert!(matches!(
        SubscriptionPreprocessMode::try_from(3),
        Err(SessionError::InvalidArgument(_))
    ));
    assert_eq!(
        SubscriptionPreprocessMode::try_from(2).unwrap(),
        SubscriptionPreprocessMode::ReturnIndividualErrors
    );
}

// --- Invalid state ---

#[test]
fn test_polling_not_allowed_with_handler() {
    let session = Session::with_handler(
        SessionOptions::default(),
        Arc::new(LoopbackTransport::new()),
        None,
        |_: &Event, _: &Session| {},
    )
    .unwrap();
    assert!(matches!(
        session.next_event(WAIT),
        Err(SessionError::InvalidState(_))
    ));
    assert!(matches!(
        session.try_next_event(),
        Err(SessionError::InvalidState(_))
    ));
}

#[test]
fn test_operations_after_stop() {
    let (session, _transport) = started_session();
    session.stop();

    let mut list = SubscriptionList::new();
    list.add("IBM US Equity", None);
    assert!(matches!(
        session.subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError),
        Err(SessionError::InvalidState(_))
    ));
    assert!(!session.start());
}

// --- Preprocessing ---

#[test]
fn test_fail_on_first_error_submits_nothing() {
    let (session, transport) = started_session();

    let mut list = SubscriptionList::new();
    list.add("IBM US Equity", Some(CorrelationId::from_int(1)));
    list.add("//blp", Some(CorrelationId::from_int(2)));
    list.add("MSFT US Equity", Some(CorrelationId::from_int(3)));

    match session.subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError) {
        Err(SessionError::SubscriptionPreprocess(error)) => {
            assert_eq!(error.correlation_id, CorrelationId::from_int(2));
            assert_eq!(error.error_code, PreprocessErrorCode::InvalidSubscriptionString);
        }
        other => panic!("expected preprocess error, got {:?}", other),
    }
    assert!(transport.operations().is_empty());
    assert_eq!(session.active_operations(), 0);
}

#[test]
fn test_individual_errors_keep_valid_entries() {
    let (session, transport) = started_session();
    let taken = CorrelationId::named("taken");
    session
        .send_request(
            Request::new("//blp/refdata", "ReferenceDataRequest"),
            None,
            Some(taken.clone()),
            None,
            "",
        )
        .unwrap();
    transport.take_operations();

    let mut list = SubscriptionList::new();
    let good = list.add("IBM US Equity", None);
    list.add("", Some(CorrelationId::from_int(8)));
    list.add("MSFT US Equity", Some(taken.clone()));
    list.add("AAPL US Equity", Some(good.clone()));

    let errors = session
        .subscribe(&list, None, "", SubscriptionPreprocessMode::ReturnIndividualErrors)
        .unwrap()
        .unwrap();
    let codes: Vec<_> = errors.iter().map(|e| e.error_code).collect();
    assert_eq!(
        codes,
        vec![
            PreprocessErrorCode::InvalidSubscriptionString,
            PreprocessErrorCode::CorrelationIdError,
            PreprocessErrorCode::CorrelationIdError,
        ]
    );
    assert_eq!(errors[1].subscription_string, "MSFT US Equity");
    assert!(errors[0].to_string().contains("INVALID_SUBSCRIPTION_STRING"));

    assert_eq!(session.subscription_state(&good), Some(SubscriptionState::Subscribing));
    match transport.take_operations().as_slice() {
        [Operation::Subscribe { subscriptions, .. }] => assert_eq!(subscriptions.len(), 1),
        other => panic!("unexpected operations {:?}", other),
    }
}

#[test]
fn test_duplicate_request_id() {
    let (session, _transport) = started_session();
    let token = CorrelationId::from_int(12);
    let request = Request::new("//blp/refdata", "ReferenceDataRequest");
    session
        .send_request(request.clone(), None, Some(token.clone()), None, "")
        .unwrap();
    match session.send_request(request, None, Some(token.clone()), None, "") {
        Err(SessionError::DuplicateCorrelation(id)) => assert_eq!(id, token),
        other => panic!("expected DuplicateCorrelation, got {:?}", other),
    }
}

// --- Transport rejection ---

#[test]
fn test_rejected_subscribe_rolls_back() {
    let (session, transport) = started_session();
    transport.reject_with(5, "not entitled");

    let token = CorrelationId::from_int(1);
    let mut list = SubscriptionList::new();
    list.add("IBM US Equity", Some(token.clone()));
    match session.subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError) {
        Err(SessionError::TransportRejection { code, description }) => {
            assert_eq!(code, 5);
            assert_eq!(description, "not entitled");
        }
        other => panic!("expected TransportRejection, got {:?}", other),
    }
    assert!(!session.is_active(&token));
    assert_eq!(session.subscription_state(&token), None);

    transport.accept();
    session
        .subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError)
        .unwrap();
    assert!(session.is_active(&token));
}

#[test]
fn test_rejected_unsubscribe_reverts_state() {
    let (session, transport) = started_session();
    let token = CorrelationId::from_int(1);
    let mut list = SubscriptionList::new();
    list.add("IBM US Equity", Some(token.clone()));
    session
        .subscribe(&list, None, "", SubscriptionPreprocessMode::FailOnFirstError)
        .unwrap();
    transport.deliver(Event::new(
        EventKind::SubscriptionStatus,
        vec![Message::status(MessageType::SubscriptionStarted, token.clone())],
    ));

    transport.reject_with(9, "busy");
    assert!(session.unsubscribe(&list).is_err());
    assert_eq!(session.subscription_state(&token), Some(SubscriptionState::Subscribed));

    assert!(session
        .resubscribe(&list, "", None, SubscriptionPreprocessMode::FailOnFirstError)
        .is_err());
    assert_eq!(session.subscription_state(&token), Some(SubscriptionState::Subscribed));
}

#[test]
fn test_rejected_request_releases_id() {
    let (session, transport) = started_session();
    transport.reject_with(3, "throttled");
    let token = CorrelationId::from_int(4);
    assert!(session
        .send_request(
            Request::new("//blp/refdata", "ReferenceDataRequest"),
            None,
            Some(token.clone()),
            None,
            ""
        )
        .is_err());
    assert!(!session.is_active(&token));

    let template_id = CorrelationId::from_int(5);
    assert!(session
        .create_snapshot_request_template("IBM US Equity", template_id.clone(), None)
        .is_err());
    assert!(!session.is_active(&template_id));
    assert!(session.request_template(&template_id).is_none());
}

// --- Templates ---

#[test]
fn test_invalid_template_subscription() {
    let (session, _transport) = started_session();
    let result = session.create_snapshot_request_template("", CorrelationId::from_int(1), None);
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
}

#[test]
fn test_template_from_other_session_rejected() {
    let (owner, _t1) = started_session();
    let (other, _t2) = started_session();
    let template = owner
        .create_snapshot_request_template("IBM US Equity", CorrelationId::named("tmpl"), None)
        .unwrap();

    assert!(matches!(
        other.send_request_template(&template, None),
        Err(SessionError::InvalidArgument(_))
    ));
}

#[test]
fn test_invalid_service_name() {
    let (session, _transport) = started_session();
    let result = session.set_status_correlation_id(
        &Service::new("refdata"),
        CorrelationId::from_int(1),
        None,
    );
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));
    assert!(!session.is_active(&CorrelationId::from_int(1)));
}
