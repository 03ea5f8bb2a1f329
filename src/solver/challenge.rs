//! Challenge page detection
//!
//! Both backends evaluate the same probe script in the page and interpret
//! its answer with [`PageState::from_probe`].

use std::time::{Duration, Instant};

/// Titles served while a challenge is running
pub const CHALLENGE_TITLES: &[&str] = &["Just a moment...", "DDoS-Guard"];

/// Elements present only while a challenge is running
pub const CHALLENGE_SELECTORS: &[&str] = &[
    "#cf-challenge-running",
    ".ray_id",
    ".attack-box",
    "#cf-please-wait",
    "#challenge-spinner",
    "#trk_jschal_js",
    "#turnstile-wrapper",
    ".lds-ring",
];

/// Title prefixes of a hard block page
pub const ACCESS_DENIED_TITLES: &[&str] = &["Access denied", "Attention Required! | Cloudflare"];

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const CHALLENGE_SOLVED: &str = "Challenge solved!";
pub const CHALLENGE_NOT_DETECTED: &str = "Challenge not detected!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Still on the generated POST form or mid-navigation
    Loading,
    Clear,
    Challenge,
    AccessDenied,
}

impl PageState {
    /// Interpret the value returned by [`probe_expression`].
    pub fn from_probe(answer: &str) -> Self {
        match answer {
            "loading" => PageState::Loading,
            "denied" => PageState::AccessDenied,
            "challenge" => PageState::Challenge,
            _ => PageState::Clear,
        }
    }
}

/// JavaScript expression that evaluates to `"loading"`, `"denied"`,
/// `"challenge"` or `"clear"` for the current document.
pub fn probe_expression() -> String {
    let list = |items: &[&str]| serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string());

    format!(
        concat!(
            "(() => {{",
            "if (location.protocol === 'data:' || document.readyState === 'loading') return 'loading';",
            "const title = document.title || '';",
            "if ({denied}.some(t => title.startsWith(t))) return 'denied';",
            "if ({titles}.some(t => title.toLowerCase() === t.toLowerCase())) return 'challenge';",
            "if ({selectors}.some(s => document.querySelector(s) !== null)) return 'challenge';",
            "return 'clear';",
            "}})()"
        ),
        denied = list(ACCESS_DENIED_TITLES),
        titles = list(CHALLENGE_TITLES),
        selectors = list(CHALLENGE_SELECTORS),
    )
}

/// How long to sleep before the next page check, or `None` once `deadline` has passed.
/// The last wait ends at the deadline.
pub fn next_poll_delay(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        None
    } else {
        Some(remaining.min(POLL_INTERVAL))
    }
}

/// Final message for a navigation, given whether a challenge was ever seen.
pub fn solve_message(challenge_seen: bool) -> &'static str {
    if challenge_seen {
        CHALLENGE_SOLVED
    } else {
        CHALLENGE_NOT_DETECTED
    }
}
