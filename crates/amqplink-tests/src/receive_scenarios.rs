//! Receive Scenarios - ReceiveClient batch, callback and pull modes

use std::time::Duration;

use amqplink::{AmqpError, Message, MessageCallback, ReceiverSettleMode, WorkStatus};

use crate::harness::SimEnv;

mod batch_tests {
    use super::*;

    #[test]
    fn test_stall_returns_available_messages() {
        let env = SimEnv::default();
        env.publish("events", 3);
        let mut options = env.options();
        options.config.receive.prefetch = 10;
        let mut client = env.receive_client("events", options);

        let batch = client.receive_message_batch(Some(10), None, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 3);
        let bodies: Vec<_> = batch.iter().map(|m| m.body().clone()).collect();
        assert_eq!(bodies, vec!["msg-0", "msg-1", "msg-2"]);
    }

    #[test]
    fn test_oversized_batch_fails_without_ticking() {
        let env = SimEnv::default();
        let mut options = env.options();
        options.config.receive.prefetch = 10;
        let mut client = env.receive_client("events", options);

        let err = client.receive_message_batch(Some(11), None, Duration::ZERO).unwrap_err();
        assert!(matches!(err, AmqpError::InvalidArgument(_)));
        assert_eq!(env.now_ms(), 0);
        assert_eq!(env.broker().stats().connections_opened, 0);
    }

    #[test]
    fn test_batch_never_exceeds_max() {
        let env = SimEnv::default();
        env.publish("events", 25);
        let mut options = env.options();
        options.config.receive.prefetch = 10;
        let mut client = env.receive_client("events", options);

        let mut total = 0;
        for _ in 0..20 {
            let batch = client
                .receive_message_batch(Some(4), None, Duration::from_millis(200))
                .unwrap();
            assert!(batch.len() <= 4);
            total += batch.len();
            if total == 25 {
                break;
            }
        }
        assert_eq!(total, 25);
    }

    #[test]
    fn test_timeout_on_empty_source_returns_empty_batch() {
        let env = SimEnv::new(50);
        let mut client = env.receive_client("events", env.options());
        let batch = client
            .receive_message_batch(Some(5), None, Duration::from_millis(400))
            .unwrap();
        assert!(batch.is_empty());
        assert!(env.now_ms() >= 400);
        assert!(client.is_open());
    }

    #[test]
    fn test_receive_and_delete_does_not_settle() {
        let env = SimEnv::default();
        env.publish("events", 2);
        let mut options = env.options();
        options.config.receive.receive_settle_mode = ReceiverSettleMode::ReceiveAndDelete;
        let mut client = env.receive_client("events", options);
        let batch = client.receive_message_batch(None, None, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(env.broker().stats().settlements, 0);
    }
}

mod callback_tests {
    use super::*;

    #[test]
    fn test_receive_messages_until_inactive() {
        let env = SimEnv::new(100);
        env.publish("events", 6);
        let mut options = env.options();
        options.config.receive.timeout_ms = 1000;
        let mut client = env.receive_client("events", options);

        let mut seen = Vec::new();
        client.receive_messages(|m| seen.push(m)).unwrap();
        assert_eq!(seen.len(), 6);
        assert!(!client.is_open());
        assert_eq!(client.do_work().unwrap(), WorkStatus::Stop);
    }

    #[test]
    fn test_transform_callback_applies_to_every_mode() {
        let env = SimEnv::new(100);
        env.publish("events", 4);
        let mut options = env.options();
        options.config.receive.timeout_ms = 500;
        let mut client = env.receive_client("events", options);
        let tag_even: MessageCallback = Box::new(|message: &Message| {
            let n: usize = std::str::from_utf8(message.body())
                .ok()
                .and_then(|b| b.strip_prefix("msg-"))
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            (n % 2 == 0).then(|| message.clone().with_application_property("even", true))
        });

        let received: Vec<_> = client
            .receive_messages_iter(Some(tag_even))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(received.len(), 4);
        let even: Vec<_> = received
            .iter()
            .filter(|m| m.application_properties.contains_key("even"))
            .map(|m| m.body().clone())
            .collect();
        assert_eq!(even, vec!["msg-0", "msg-2"]);
        assert_eq!(received[1].body().as_ref(), b"msg-1");
        assert_eq!(env.broker().stats().settlements, 4);
    }

    #[test]
    fn test_callback_without_replacement_loses_nothing() {
        let env = SimEnv::default();
        env.publish("events", 3);
        let mut client = env.receive_client("events", env.options());
        let observe: MessageCallback = Box::new(|_: &Message| None);
        let batch = client
            .receive_message_batch(None, Some(observe), Duration::from_millis(300))
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(env.broker().stats().settlements, 3);
        assert_eq!(env.broker().queue_len("events"), 0);
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_double_close_is_noop() {
        let env = SimEnv::default();
        let mut client = env.receive_client("events", env.options());
        client.open(None).unwrap();
        client.close();
        client.close();
        assert!(!client.is_open());
        assert_eq!(env.broker().stats().connections_closed, 1);
    }

    #[test]
    fn test_reset_stops_client() {
        let env = SimEnv::default();
        let mut client = env.receive_client("events", env.options());
        client.open(None).unwrap();
        for _ in 0..3 {
            assert_eq!(client.do_work().unwrap(), WorkStatus::Continue);
        }
        env.broker().reset_next_tick();
        let mut status = WorkStatus::Continue;
        for _ in 0..3 {
            status = client.do_work().unwrap();
        }
        assert_eq!(status, WorkStatus::Stop);
        assert!(client.connection().map(|c| c.is_closed()).unwrap_or(false));
    }
}
