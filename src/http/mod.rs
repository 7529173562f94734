//! HTTP layer for the ECR proxy.
//!
//! Registry requests under `/v2/` pass the IP allow-list, get the current
//! registry credential stamped on, and are relayed to ECR with bodies
//! streamed both ways.

pub mod authorizer;
pub mod forward;
pub mod handler;
pub mod request_log;
