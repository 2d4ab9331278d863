//! Property-Based Tests for the clients - universally quantified send/receive/retry invariants

use std::time::Duration;

use amqplink::sim::{DispositionPolicy, TokenPolicy};
use amqplink::{AmqpError, CbsStatus, Connection, Message, MessageState, TokenRetryPolicy};
use proptest::prelude::*;

use crate::harness::SimEnv;

fn disposition() -> impl Strategy<Value = DispositionPolicy> {
    prop_oneof![
        Just(DispositionPolicy::Accept),
        Just(DispositionPolicy::Reject("amqp:internal-error".to_string())),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_send_all_status_per_message(batches in prop::collection::vec(1usize..5, 0..6), policy in disposition()) {
        let env = SimEnv::default();
        env.broker().set_disposition_policy(policy);
        let mut client = env.send_client("orders", env.options());
        let mut queued = 0;
        for size in batches {
            let messages: Vec<_> = (0..size).map(|i| Message::new(format!("m{}", i))).collect();
            client.queue_message(messages);
            queued += size;
        }
        let states = client.send_all_messages(true).unwrap();
        prop_assert_eq!(states.len(), queued);
        prop_assert!(states.iter().all(|s| matches!(s, MessageState::Complete | MessageState::Failed)));
    }

    #[test]
    fn prop_batch_never_exceeds_max(available in 0usize..30, prefetch in 1u32..16, max in 1usize..16) {
        let env = SimEnv::default();
        env.publish("events", available);
        let mut options = env.options();
        options.config.receive.prefetch = prefetch;
        let mut client = env.receive_client("events", options);

        let result = client.receive_message_batch(Some(max), None, Duration::from_millis(200));
        if max > prefetch as usize {
            prop_assert!(matches!(result, Err(AmqpError::InvalidArgument(_))));
            prop_assert_eq!(env.broker().stats().connections_opened, 0);
        } else {
            let batch = result.unwrap();
            prop_assert!(batch.len() <= max);
            prop_assert!(batch.len() <= available);
        }
    }

    #[test]
    fn prop_token_retries_exhaust_after_policy(retries in 0u32..5) {
        let env = SimEnv::default();
        env.broker().set_token_policy(TokenPolicy::Refuse { status_code: 401, description: "denied".to_string() });
        let mut options = env.token_options("hub");
        options.config.cbs.retry = TokenRetryPolicy::new(retries, Duration::ZERO);
        let mut client = env.amqp_client("hub", options);
        client.open(None).unwrap();

        let mut outcome = Ok(amqplink::WorkStatus::Continue);
        for _ in 0..200 {
            outcome = client.do_work();
            if outcome.is_err() {
                break;
            }
        }
        prop_assert!(
            matches!(outcome, Err(AmqpError::TokenAuthFailure { status_code: 401, .. })),
            "unexpected outcome: {:?}",
            outcome
        );
        let cbs = client.connection().and_then(Connection::cbs).unwrap();
        prop_assert_eq!(cbs.retries(), retries);
        prop_assert_eq!(cbs.status(), CbsStatus::Error);
        prop_assert_eq!(env.broker().stats().token_requests, u64::from(retries) + 1);
    }
}
