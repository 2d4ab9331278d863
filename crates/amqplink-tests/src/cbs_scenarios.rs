//! CBS Scenarios - token negotiation through clients and shared connections

use std::sync::Arc;
use std::time::Duration;

use amqplink::sim::TokenPolicy;
use amqplink::{
    AmqpError, Auth, CbsAuthenticator, CbsStatus, Connection, Message, SasTokenAuth, ThreadSleeper, TokenExpiry,
    TokenRetryPolicy, WorkStatus,
};

use crate::harness::{SimEnv, SIM_HOST};

fn token_connection(env: &SimEnv, retries: u32) -> Connection {
    let uri = env.uri("hub");
    let auth = SasTokenAuth::new(format!("sb://{}/hub", SIM_HOST), &uri, "token", TokenExpiry::ExpiresIn(Duration::from_secs(3600)))
        .unwrap()
        .with_retry_policy(TokenRetryPolicy::new(retries, Duration::ZERO));
    Connection::builder(env.target("hub").address())
        .auth(Auth::SasToken(auth))
        .counter(env.counter().clone())
        .sleeper(Arc::new(ThreadSleeper))
        .open(env.broker().engine())
        .unwrap()
}

/// Ticks until the outstanding PUT-token request has an answer.
fn await_answer(conn: &Connection, cbs: &CbsAuthenticator) {
    for _ in 0..20 {
        if cbs.status() != CbsStatus::InProgress {
            return;
        }
        conn.tick();
    }
    panic!("no answer to put-token");
}

mod retry_tests {
    use super::*;

    #[test]
    fn test_retry_counter_increments_then_fails() {
        let env = SimEnv::default();
        env.broker().set_token_policy(TokenPolicy::Refuse {
            status_code: 401,
            description: "InvalidSignature".to_string(),
        });
        let conn = token_connection(&env, 3);
        let cbs = conn.cbs().unwrap();

        assert!(cbs.handle_token().unwrap().in_progress);
        await_answer(&conn, &cbs);
        for expected in 1..=3 {
            assert_eq!(cbs.status(), CbsStatus::Error);
            let progress = cbs.handle_token().unwrap();
            assert!(progress.in_progress);
            assert_eq!(cbs.retries(), expected);
            await_answer(&conn, &cbs);
        }

        match cbs.handle_token() {
            Err(AmqpError::TokenAuthFailure { status_code, description }) => {
                assert_eq!(status_code, 401);
                assert_eq!(description, "InvalidSignature");
            }
            other => panic!("expected TokenAuthFailure, got {:?}", other),
        }
        assert_eq!(env.broker().stats().token_requests, 4);
        conn.close();
    }

    #[test]
    fn test_client_surfaces_retry_exhaustion() {
        let env = SimEnv::default();
        env.broker().set_token_policy(TokenPolicy::Refuse {
            status_code: 403,
            description: "Forbidden".to_string(),
        });
        let mut client = env.send_client("hub", env.token_options("hub"));
        let err = client.send_message(Message::new("a"), false).unwrap_err();
        assert!(matches!(err, AmqpError::TokenAuthFailure { status_code: 403, .. }));
        assert!(!client.is_open());
    }

    #[test]
    fn test_recovers_after_one_refusal() {
        let env = SimEnv::default();
        env.broker().script_tokens([TokenPolicy::Refuse {
            status_code: 503,
            description: "ServerBusy".to_string(),
        }]);
        let mut client = env.send_client("hub", env.token_options("hub"));
        client.send_message(Message::new("a"), false).unwrap();
        let cbs = client.connection().and_then(Connection::cbs).unwrap();
        assert_eq!(cbs.status(), CbsStatus::Ok);
        assert_eq!(cbs.retries(), 1);
        assert_eq!(env.broker().queue_len("hub"), 1);
    }
}

mod timeout_tests {
    use super::*;

    #[test]
    fn test_unanswered_token_times_out_client() {
        let env = SimEnv::new(500);
        env.broker().set_token_policy(TokenPolicy::Silent);
        let mut client = env.receive_client("hub", env.token_options("hub"));
        let err = client.receive_messages(|_| {}).unwrap_err();
        match err {
            AmqpError::Timeout { operation, timeout_ms } => {
                assert_eq!(operation, "authorization");
                assert_eq!(timeout_ms, 10_000);
            }
            other => panic!("expected authorization timeout, got {:?}", other),
        }
        assert!(env.now_ms() >= 10_000);
    }
}

mod shared_connection_tests {
    use super::*;

    #[test]
    fn test_clients_share_token_connection() {
        let env = SimEnv::default();
        let conn = token_connection(&env, 3);

        let mut sender = env.send_client("hub", env.options());
        sender.open(Some(conn.clone())).unwrap();
        sender.send_message(Message::new("shared"), false).unwrap();

        let mut receiver = env.receive_client("hub", env.options());
        receiver.open(Some(conn.clone())).unwrap();
        let batch = receiver.receive_message_batch(Some(1), None, Duration::ZERO).unwrap();
        assert_eq!(batch.len(), 1);

        sender.close();
        receiver.close();
        assert!(!conn.is_closed());
        assert_eq!(env.broker().stats().token_requests, 1);
        assert_eq!(env.broker().stats().connections_opened, 1);

        let cbs = conn.cbs().unwrap();
        assert_eq!(cbs.status(), CbsStatus::Ok);
        assert!(!cbs.session().is_destroyed());
        conn.close();
        assert!(cbs.session().is_destroyed());
    }

    #[test]
    fn test_closed_connection_stops_work() {
        let env = SimEnv::default();
        let conn = token_connection(&env, 3);
        let mut client = env.amqp_client("hub", env.options());
        client.open(Some(conn.clone())).unwrap();
        conn.close();
        assert_eq!(client.do_work().unwrap(), WorkStatus::Stop);
    }
}
