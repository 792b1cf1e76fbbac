//! HTTP client module
//!
//! Provides the session-scoped HTTP client with retry, rate limiting and
//! the challenge-bypass hook.
//!
//! # Features
//!
//! - **Rate Limiting**: minimum spacing measured from the previous request's finish
//! - **Retry Budget**: a fixed backoff schedule drawn down across nested calls
//! - **Status Classification**: 401/402/403/407/410 are terminal, other non-200s retry
//! - **Challenge Bypass**: optional one-shot solver for 503 challenge pages

mod challenge;
mod client;
mod rate_limit;
mod retry;

pub use challenge::{is_challenge, ChallengeSolver, ChallengeTokens};
pub use client::{HttpClient, HttpRequest, RequestConfig};
pub use rate_limit::{RateLimiter, RequestPermit};
pub use retry::{RetryBudget, RetryOn, RetryPolicy};
