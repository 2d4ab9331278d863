//! Async Scenarios - tokio wrappers over the blocking clients

use std::time::Duration;

use amqplink::sim::AttachPolicy;
use amqplink::{
    AmqpError, AsyncAmqpClient, AsyncReceiveClient, AsyncSendClient, Message, MessageState, MgmtOptions, MgmtResult,
};
use futures::StreamExt;

use crate::harness::SimEnv;

fn async_sender(env: &SimEnv, entity: &str, options: amqplink::ClientOptions) -> AsyncSendClient {
    AsyncSendClient::new(env.target(entity), env.broker().factory(), options)
}

fn async_receiver(env: &SimEnv, entity: &str, options: amqplink::ClientOptions) -> AsyncReceiveClient {
    AsyncReceiveClient::new(env.source(entity), env.broker().factory(), options)
}

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_receive() {
        let env = SimEnv::default();
        let sender = async_sender(&env, "events", env.options());
        sender
            .send_message(vec![Message::new("x"), Message::new("y")], true)
            .await
            .unwrap();

        let receiver = async_receiver(&env, "events", env.options());
        let batch = receiver
            .receive_message_batch(None, None, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        receiver.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_timeout_when_attach_stalls() {
        let env = SimEnv::new(100);
        env.broker().set_attach_policy(AttachPolicy::Stall);
        let mut options = env.options();
        options.config.send.msg_timeout_ms = 1000;
        let sender = async_sender(&env, "orders", options);
        let err = sender.send_message(Message::new("late"), false).await.unwrap_err();
        assert!(matches!(err, AmqpError::MessageSendFailed { failed: 1, total: 1 }));
    }

    #[tokio::test]
    async fn test_send_all_reports_every_message() {
        let env = SimEnv::default();
        let sender = async_sender(&env, "orders", env.options());
        for i in 0..5 {
            sender.queue_message(Message::new(format!("m{}", i)));
        }
        let states = sender.send_all_messages(true).await.unwrap();
        assert_eq!(states, vec![MessageState::Complete; 5]);
        assert!(!sender.messages_pending());
    }
}

mod receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let env = SimEnv::default();
        let mut options = env.options();
        options.config.receive.prefetch = 2;
        let receiver = async_receiver(&env, "events", options);
        let err = receiver
            .receive_message_batch(Some(3), None, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::InvalidArgument(_)));
        assert_eq!(env.broker().stats().connections_opened, 0);
    }

    #[tokio::test]
    async fn test_stream_yields_until_inactive() {
        let env = SimEnv::new(100);
        env.publish("events", 5);
        let mut options = env.options();
        options.config.receive.timeout_ms = 400;
        let receiver = async_receiver(&env, "events", options);

        let bodies: Vec<_> = receiver
            .messages()
            .map(|m| m.map(|m| m.body().clone()))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(bodies.len(), 5);
        assert_eq!(bodies[4], "msg-4");
        assert_eq!(env.broker().stats().connections_closed, 1);
    }
}

mod mgmt_tests {
    use super::*;

    #[tokio::test]
    async fn test_async_mgmt_request_with_token() {
        let env = SimEnv::default();
        let client = AsyncAmqpClient::new(env.target("hub").address().clone(), env.broker().factory(), env.token_options("hub"));
        client.open(None).await.unwrap();
        let response = client
            .mgmt_request(Message::new("q"), "READ", "entity", &MgmtOptions::default())
            .await
            .unwrap();
        assert_eq!(response.result, MgmtResult::Ok);
        assert_eq!(env.broker().stats().token_requests, 1);
        client.close().await.unwrap();
        client.close().await.unwrap();
    }
}
