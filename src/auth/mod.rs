//! Client access control.
//!
//! Registry traffic is admitted by source address against an IP / CIDR
//! allow-list.

pub mod allowlist;
