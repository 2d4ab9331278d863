//! Management Scenarios - request/response correlation on management nodes

use std::sync::Arc;
use std::time::Duration;

use amqplink::sim::NodeHandler;
use amqplink::{
    AmqpError, AmqpValue, Auth, Connection, Message, MgmtOperation, MgmtOptions, MgmtResult, Session,
    SessionConfig,
};

use crate::harness::SimEnv;

fn session(env: &SimEnv) -> Session {
    let conn = Connection::builder(env.target("hub").address())
        .auth(Auth::SaslAnonymous)
        .counter(env.counter().clone())
        .open(env.broker().engine())
        .unwrap();
    Session::begin(&conn, SessionConfig::default()).unwrap()
}

fn silent() -> NodeHandler {
    Arc::new(|_: &Message| -> Option<Message> { None })
}

mod execute_tests {
    use super::*;

    #[test]
    fn test_timeout_removes_pending_operation() {
        let env = SimEnv::new(10);
        env.broker().set_node_handler("$silent", silent());
        let session = session(&env);
        let op = MgmtOperation::open(&session, MgmtOptions::node("$silent"));

        let started = env.now_ms();
        let err = op
            .execute("READ", "entity", Message::new("q"), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, AmqpError::Timeout { timeout_ms: 100, .. }));
        let elapsed = env.now_ms() - started;
        assert!((100..=120).contains(&elapsed), "elapsed {}", elapsed);
        assert_eq!(op.pending_operations(), 0);
        op.destroy();
    }

    #[test]
    fn test_concurrent_requests_matched_by_correlation() {
        let env = SimEnv::default();
        let session = session(&env);
        let op = MgmtOperation::open(&session, MgmtOptions::default());

        let first = op.submit("READ", "entity", Message::new("first")).unwrap();
        let second = op.submit("READ", "entity", Message::new("second")).unwrap();
        assert_eq!(op.pending_operations(), 2);

        let mut answers = Vec::new();
        for _ in 0..20 {
            session.connection().tick();
            op.poll();
            for id in [&first, &second] {
                if let Some(response) = op.take_response(id) {
                    answers.push((id.clone(), response));
                }
            }
            if answers.len() == 2 {
                break;
            }
        }
        assert_eq!(answers.len(), 2);
        for (id, response) in answers {
            let body = response.message.unwrap().body().clone();
            let expected = if id == first { "first" } else { "second" };
            assert_eq!(body, expected);
        }
        assert_eq!(op.pending_operations(), 0);
    }

    #[test]
    fn test_connection_reset_fails_request() {
        let env = SimEnv::default();
        let session = session(&env);
        let op = MgmtOperation::open(&session, MgmtOptions::default());
        op.execute("READ", "entity", Message::new("warm"), Duration::from_secs(1))
            .unwrap();

        env.broker().reset_next_tick();
        let outcome = op.execute("READ", "entity", Message::new("lost"), Duration::from_secs(1));
        assert!(
            matches!(
                outcome,
                Err(AmqpError::ConnectionClosed { .. } | AmqpError::Management { .. })
            ),
            "unexpected outcome: {:?}",
            outcome
        );
        assert_eq!(op.pending_operations(), 0);
    }

    #[test]
    fn test_error_status_surfaces_in_response() {
        let env = SimEnv::default();
        let handler: NodeHandler = Arc::new(|request: &Message| -> Option<Message> {
            let mut response = Message::new(request.body().clone());
            response
                .application_properties
                .insert("statusCode".to_string(), AmqpValue::from(404i32));
            response
                .application_properties
                .insert("statusDescription".to_string(), AmqpValue::from("entity not found"));
            Some(response)
        });
        env.broker().set_node_handler("$management", handler);
        let session = session(&env);

        let response = session
            .mgmt_request(Message::new("q"), "READ", "entity", &MgmtOptions::default())
            .unwrap();
        assert_eq!(response.result, MgmtResult::Error);
        assert_eq!(response.status_code, 404);
        assert_eq!(response.description, "entity not found");
    }
}

mod client_tests {
    use super::*;

    #[test]
    fn test_client_mgmt_request_after_token() {
        let env = SimEnv::default();
        let mut client = env.amqp_client("hub", env.token_options("hub"));
        client.open(None).unwrap();
        let response = client
            .mgmt_request(Message::new("props"), "READ", "com.example:eventhub", &MgmtOptions::default())
            .unwrap();
        assert_eq!(response.result, MgmtResult::Ok);
        assert_eq!(env.broker().stats().token_requests, 1);
        assert_eq!(env.broker().stats().mgmt_requests, 1);
        client.close();
        client.close();
    }

    #[test]
    fn test_mgmt_request_timeout_option() {
        let env = SimEnv::new(25);
        env.broker().set_node_handler("$management", silent());
        let mut client = env.amqp_client("hub", env.options());
        client.open(None).unwrap();
        let options = MgmtOptions::default().with_timeout(Duration::from_millis(200));
        assert!(matches!(
            client.mgmt_request(Message::new("q"), "READ", "entity", &options),
            Err(AmqpError::Timeout { .. })
        ));
    }
}
