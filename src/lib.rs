//! Sluice - Leaky Bucket Admission Gate
//!
//! This crate implements a leaky-bucket rate limiter that gates inbound HTTP
//! requests before relaying them to an upstream service. A fixed-capacity
//! bucket is filled by admissions and drained one slot per interval by a
//! background task; requests that find the bucket full are rejected with
//! `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
