use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CLAIM_LIMIT: usize = 10;

/// Parameters for taking a new claim.
///
/// `ttl` bounds the claim itself. Claimed messages stay hidden for
/// `ttl + grace` seconds so they do not reappear the instant the claim lapses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRequest {
    pub ttl: u32,
    #[serde(default)]
    pub grace: u32,
}

impl ClaimRequest {
    pub fn new(ttl: u32, grace: u32) -> Self {
        Self { ttl, grace }
    }

    pub fn message_ttl(&self) -> u32 {
        self.ttl.saturating_add(self.grace)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRenewal {
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimView {
    pub id: String,
    pub ttl: i64,
    pub age: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub id: String,
    pub ttl: i64,
    pub age: i64,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    pub ttl: u32,
    pub body: Value,
}

impl NewMessage {
    pub fn new(ttl: u32, body: Value) -> Self {
        Self { ttl, body }
    }
}

/// Whole seconds elapsed between two millisecond timestamps, truncated.
pub fn age_seconds(created_ms: i64, now_ms: i64) -> i64 {
    (now_ms - created_ms).div_euclid(1000)
}
