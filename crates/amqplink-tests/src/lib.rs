//! amqplink Test & Validation Infrastructure
//!
//! Scenario and property tests driving the public client API against the
//! simulated broker in `amqplink::sim`, plus the harness they share.

pub mod harness;

#[cfg(test)]
mod async_scenarios;
#[cfg(test)]
mod cbs_scenarios;
#[cfg(test)]
mod mgmt_scenarios;
#[cfg(test)]
mod proptest_client;
#[cfg(test)]
mod receive_scenarios;
#[cfg(test)]
mod send_scenarios;

pub use harness::{init_tracing, SimEnv, SIM_HOST};
