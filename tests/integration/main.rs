// Integration tests against a live broker. They are ignored by default; run them with
// `cargo test -- --ignored` once RabbitMQ is reachable through the RMQ_* settings.

mod common;
mod rpc_test;
