//! Send Scenarios - SendClient against the simulated broker

use amqplink::constants::{ANNOTATION_ENQUEUED_TIME, ANNOTATION_OFFSET, ANNOTATION_SEQUENCE_NUMBER};
use amqplink::sim::{AttachPolicy, DispositionPolicy};
use amqplink::{AmqpError, BatchMessage, LinkState, Message, MessageState, SenderSettleMode};

use crate::harness::SimEnv;

mod send_message_tests {
    use super::*;

    #[test]
    fn test_message_timeout_when_link_never_attaches() {
        let env = SimEnv::new(100);
        env.broker().set_attach_policy(AttachPolicy::Stall);
        let mut options = env.options();
        options.config.send.msg_timeout_ms = 1000;
        let mut client = env.send_client("orders", options);

        let err = client.send_message(Message::new("stuck"), false).unwrap_err();
        match err {
            AmqpError::MessageSendFailed { failed, total } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 1);
            }
            other => panic!("expected MessageSendFailed, got {:?}", other),
        }
        assert!(env.now_ms() >= 1000);
        assert_eq!(env.broker().stats().transfers, 0);
        assert_eq!(client.link_state(), Some(LinkState::Opening));
    }

    #[test]
    fn test_message_timeout_when_never_settled() {
        let env = SimEnv::new(100);
        env.broker().set_disposition_policy(DispositionPolicy::Silent);
        let mut options = env.options();
        options.config.send.msg_timeout_ms = 1000;
        let mut client = env.send_client("orders", options);

        assert!(matches!(
            client.send_message(Message::new("unsettled"), true),
            Err(AmqpError::MessageSendFailed { failed: 1, total: 1 })
        ));
        assert_eq!(env.broker().stats().transfers, 1);
        assert!(!client.is_open());
    }

    #[test]
    fn test_batch_message_sent_as_individual_messages() {
        let env = SimEnv::default();
        let mut client = env.send_client("orders", env.options());
        let mut batch = BatchMessage::new();
        for i in 0..4 {
            batch.push(Message::new(format!("item-{}", i)));
        }
        client.send_message(batch, true).unwrap();
        assert_eq!(env.broker().queue_len("orders"), 4);
        assert_eq!(env.broker().stats().transfers, 4);
    }

    #[test]
    fn test_settled_mode_completes_without_disposition() {
        let env = SimEnv::default();
        env.broker().set_disposition_policy(DispositionPolicy::Silent);
        let mut options = env.options();
        options.config.send.send_settle_mode = SenderSettleMode::Settled;
        let mut client = env.send_client("orders", options);
        client.send_message(vec![Message::new("a"), Message::new("b")], true).unwrap();
        assert_eq!(env.broker().stats().transfers, 2);
    }

    #[test]
    fn test_partial_rejection_reports_failed_count() {
        let env = SimEnv::default();
        let mut client = env.send_client("orders", env.options());
        client.send_message(Message::new("first"), false).unwrap();

        env.broker()
            .set_disposition_policy(DispositionPolicy::Reject("amqp:resource-limit-exceeded".to_string()));
        let err = client
            .send_message(vec![Message::new("a"), Message::new("b"), Message::new("c")], false)
            .unwrap_err();
        assert!(matches!(err, AmqpError::MessageSendFailed { failed: 3, total: 3 }));
        assert!(client.is_open());
    }
}

mod send_all_tests {
    use super::*;

    #[test]
    fn test_status_list_matches_queue() {
        let env = SimEnv::default();
        let mut client = env.send_client("orders", env.options());
        for i in 0..7 {
            client.queue_message(Message::new(format!("m{}", i)));
        }
        let states = client.send_all_messages(false).unwrap();
        assert_eq!(states.len(), 7);
        assert!(states.iter().all(|s| *s == MessageState::Complete));
        assert!(client.is_open());
    }

    #[test]
    fn test_send_all_with_nothing_queued() {
        let env = SimEnv::default();
        let mut client = env.send_client("orders", env.options());
        let states = client.send_all_messages(true).unwrap();
        assert!(states.is_empty());
        assert!(!client.is_open());
    }

    #[test]
    fn test_reset_cancels_remaining_messages() {
        let env = SimEnv::default();
        env.broker().set_disposition_policy(DispositionPolicy::Silent);
        let mut client = env.send_client("orders", env.options());
        client.open(None).unwrap();
        client.queue_message(vec![Message::new("a"), Message::new("b")]);
        for _ in 0..3 {
            client.do_work().unwrap();
        }
        env.broker().reset_next_tick();

        let states = client.send_all_messages(false).unwrap();
        assert_eq!(states, vec![MessageState::Failed; 2]);
        assert!(!client.is_open());
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_double_close_is_noop() {
        let env = SimEnv::default();
        let mut client = env.send_client("orders", env.options());
        client.open(None).unwrap();
        client.close();
        client.close();
        assert!(!client.is_open());
        assert_eq!(env.broker().stats().connections_closed, 1);
    }

    #[test]
    fn test_transient_errors_do_not_fail_send() {
        let env = SimEnv::default();
        env.broker().fail_ticks(3);
        let mut client = env.send_client("orders", env.options());
        client.send_message(Message::new("resilient"), true).unwrap();
        assert_eq!(env.broker().queue_len("orders"), 1);
    }

    #[test]
    fn test_annotations_round_trip() {
        let env = SimEnv::default();
        let mut sender = env.send_client("events", env.options());
        let message = Message::new("annotated")
            .with_annotation(ANNOTATION_SEQUENCE_NUMBER, 42i64)
            .with_annotation(ANNOTATION_OFFSET, "1024")
            .with_annotation(ANNOTATION_ENQUEUED_TIME, 1_700_000_000_000i64);
        sender.send_message(message, true).unwrap();

        let mut receiver = env.receive_client("events", env.options());
        let batch = receiver
            .receive_message_batch(Some(1), None, std::time::Duration::ZERO)
            .unwrap();
        assert_eq!(batch.len(), 1);
        let received = &batch[0];
        assert_eq!(received.sequence_number(), Some(42));
        assert_eq!(received.offset(), Some("1024"));
        assert_eq!(received.enqueued_time(), Some(1_700_000_000_000));
        receiver.close();
    }

    #[test]
    fn test_wait_returns_once_stale_messages_expire() {
        let env = SimEnv::new(100);
        env.broker().set_attach_policy(AttachPolicy::Stall);
        let mut options = env.options();
        options.config.send.msg_timeout_ms = 300;
        let mut client = env.send_client("orders", options);
        client.open(None).unwrap();
        client.queue_message(Message::new("late"));
        assert!(client.wait().unwrap());
        assert!(!client.messages_pending());
        assert!(env.now_ms() >= 300);
    }
}
