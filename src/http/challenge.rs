//! Anti-bot challenge bypass hook
//!
//! Some portals sit behind an interstitial JavaScript challenge that
//! answers every request with a 503. When a source opts in, the client
//! recognises the challenge page, asks an external [`ChallengeSolver`] for
//! clearance cookies and a matching user agent, installs both into the
//! session and replays the request once.

use crate::error::Result;
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, SERVER};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Clearance material returned by a solver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeTokens {
    /// Cookies to install for the challenged host
    pub cookies: Vec<(String, String)>,
    /// User agent the cookies are bound to
    pub user_agent: String,
}

/// External collaborator able to pass a challenge page
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Obtain clearance for `url`
    async fn solve(&self, url: &Url, user_agent: Option<&str>) -> Result<ChallengeTokens>;
}

/// Check a response for the challenge signature
pub fn is_challenge(status: u16, headers: &HeaderMap, body: &str) -> bool {
    if status != 503 {
        return false;
    }
    let from_cloudflare = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|server| server.to_ascii_lowercase().starts_with("cloudflare"));

    from_cloudflare && body.contains("jschl_vc") && body.contains("jschl_answer")
}

/// One-shot bypass state of a session
pub(crate) struct ChallengeBypass {
    solver: Arc<dyn ChallengeSolver>,
    armed: AtomicBool,
}

impl ChallengeBypass {
    pub(crate) fn new(solver: Arc<dyn ChallengeSolver>) -> Self {
        Self {
            solver,
            armed: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Solve the challenge and install the cookies into `jar`
    ///
    /// Disarms itself on the first call whatever the outcome. Returns the
    /// user agent to use from now on, or `None` when already disarmed.
    pub(crate) async fn bypass(
        &self,
        url: &Url,
        user_agent: Option<&str>,
        jar: &Jar,
    ) -> Option<String> {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return None;
        }

        info!(url = %url, "Challenge page detected, trying to bypass");
        match self.solver.solve(url, user_agent).await {
            Ok(tokens) => {
                for (name, value) in &tokens.cookies {
                    jar.add_cookie_str(&format!("{name}={value}; Path=/"), url);
                }
                Some(tokens.user_agent)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Challenge bypass failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for ChallengeBypass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeBypass")
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod challenge_tests {
    use super::*;
    use crate::error::Error;
    use reqwest::cookie::CookieStore;
    use reqwest::header::HeaderValue;
    use std::sync::atomic::AtomicUsize;

    const CHALLENGE_BODY: &str =
        r#"<form id="challenge-form"><input name="jschl_vc"/><input name="jschl_answer"/></form>"#;

    struct CountingSolver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ChallengeSolver for CountingSolver {
        async fn solve(&self, _url: &Url, _ua: Option<&str>) -> Result<ChallengeTokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("solver down".into()));
            }
            Ok(ChallengeTokens {
                cookies: vec![("cf_clearance".into(), "token".into())],
                user_agent: "Solver/1.0".into(),
            })
        }
    }

    fn cloudflare_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static("cloudflare"));
        headers
    }

    #[test]
    fn test_signature_detection() {
        assert!(is_challenge(503, &cloudflare_headers(), CHALLENGE_BODY));
        assert!(!is_challenge(200, &cloudflare_headers(), CHALLENGE_BODY));
        assert!(!is_challenge(503, &HeaderMap::new(), CHALLENGE_BODY));
        assert!(!is_challenge(503, &cloudflare_headers(), "Service Unavailable"));
    }

    #[tokio::test]
    async fn test_bypass_is_one_shot() {
        let solver = Arc::new(CountingSolver {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let bypass = ChallengeBypass::new(solver.clone());
        let jar = Jar::default();
        let url = Url::parse("https://portal.example.org/api").unwrap();

        let ua = bypass.bypass(&url, None, &jar).await;
        assert_eq!(ua.as_deref(), Some("Solver/1.0"));
        assert!(!bypass.is_armed());

        let cookies = jar.cookies(&url).unwrap();
        assert_eq!(cookies.to_str().unwrap(), "cf_clearance=token");

        assert!(bypass.bypass(&url, None, &jar).await.is_none());
        assert_eq!(solver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_solver_disarms() {
        let solver = Arc::new(CountingSolver {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let bypass = ChallengeBypass::new(solver);
        let jar = Jar::default();
        let url = Url::parse("https://portal.example.org/").unwrap();

        assert!(bypass.bypass(&url, None, &jar).await.is_none());
        assert!(!bypass.is_armed());
    }
}
