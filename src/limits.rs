//! Server-advertised rate-limit accounting.
//!
//! The ledger tracks the request and token budgets the API reports in its
//! `x-ratelimit-*` response headers. Workers pre-debit both budgets before
//! sending a request and stall while either would be exceeded; each response
//! replaces the ledger with the server's live values. Until the first
//! response arrives both budgets are unbounded - the server is the source
//! of truth.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Milliseconds to sleep between admission attempts while a budget is
/// exhausted.
const MS_SLEEP_ON_LIMIT: u64 = 100;

/// Estimate the token cost of a text from the characters-to-tokens ratio.
///
/// The conversion truncates, so zero-length texts cost zero tokens.
pub fn estimate_tokens(text: &str, tokens_per_character: f32) -> u64 {
    (text.len() as f32 * tokens_per_character) as u64
}

/// A complete rate-limit update parsed from one response's headers.
///
/// The server advertises all six fields together; a response missing or
/// mangling any of them yields no update at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitUpdate {
    /// Request capacity per window.
    pub request_limit: u64,
    /// Token capacity per window.
    pub token_limit: u64,
    /// Requests left in the current window.
    pub requests_remaining: u64,
    /// Tokens left in the current window.
    pub tokens_remaining: u64,
    /// Milliseconds until the request budget resets.
    pub request_reset_ms: u64,
    /// Milliseconds until the token budget resets.
    pub token_reset_ms: u64,
}

impl RateLimitUpdate {
    /// Parse an update from a flat list of lowercased header pairs.
    ///
    /// Returns `None` unless all six `x-ratelimit-*` fields are present and
    /// well-formed.
    pub fn from_headers(headers: &[(String, String)]) -> Option<Self> {
        let field = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.trim())
        };

        Some(Self {
            request_limit: field("x-ratelimit-limit-requests")?.parse().ok()?,
            token_limit: field("x-ratelimit-limit-tokens")?.parse().ok()?,
            requests_remaining: field("x-ratelimit-remaining-requests")?.parse().ok()?,
            tokens_remaining: field("x-ratelimit-remaining-tokens")?.parse().ok()?,
            request_reset_ms: parse_duration_ms(field("x-ratelimit-reset-requests")?)?,
            token_reset_ms: parse_duration_ms(field("x-ratelimit-reset-tokens")?)?,
        })
    }
}

#[derive(Debug)]
struct LedgerState {
    request_limit: u64,
    token_limit: u64,
    requests_remaining: u64,
    tokens_remaining: u64,
    request_reset_at: Option<Instant>,
    token_reset_at: Option<Instant>,
    request_reset_done: bool,
    token_reset_done: bool,
}

impl LedgerState {
    fn unbounded() -> Self {
        Self {
            request_limit: u64::MAX,
            token_limit: u64::MAX,
            requests_remaining: u64::MAX,
            tokens_remaining: u64::MAX,
            request_reset_at: None,
            token_reset_at: None,
            request_reset_done: false,
            token_reset_done: false,
        }
    }

    /// Restore a budget to its limit once its reset deadline has passed.
    fn refill_elapsed(&mut self, now: Instant) {
        if !self.request_reset_done {
            if let Some(at) = self.request_reset_at {
                if now >= at {
                    self.request_reset_done = true;
                    self.requests_remaining = self.request_limit;
                }
            }
        }

        if !self.token_reset_done {
            if let Some(at) = self.token_reset_at {
                if now >= at {
                    self.token_reset_done = true;
                    self.tokens_remaining = self.token_limit;
                }
            }
        }
    }
}

/// Shared rate-limit ledger, one per client.
///
/// All fields live behind a single mutex; the critical sections are a debit
/// or a header ingest, never a sleep or an HTTP call.
#[derive(Debug)]
pub struct RateLimitLedger {
    state: Mutex<LedgerState>,
}

impl RateLimitLedger {
    /// Create a ledger with both budgets unbounded.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::unbounded()),
        }
    }

    /// Block until the ledger admits a request costing `est_tokens` tokens,
    /// then debit one request and `est_tokens` from the remaining budgets.
    ///
    /// Returns `false` without debiting if `abort` is raised while waiting.
    pub async fn admit(&self, est_tokens: u64, abort: &AtomicBool) -> bool {
        loop {
            if abort.load(Ordering::Relaxed) {
                return false;
            }

            {
                let mut state = self.state.lock();
                state.refill_elapsed(Instant::now());

                if state.requests_remaining > 0 && state.tokens_remaining > est_tokens {
                    state.requests_remaining -= 1;
                    state.tokens_remaining -= est_tokens;
                    return true;
                }
            }

            tokio::time::sleep(Duration::from_millis(MS_SLEEP_ON_LIMIT)).await;
        }
    }

    /// Replace the ledger with the server's live values.
    pub fn ingest(&self, update: RateLimitUpdate) {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.request_limit = update.request_limit;
        state.token_limit = update.token_limit;
        state.requests_remaining = update.requests_remaining;
        state.tokens_remaining = update.tokens_remaining;
        state.request_reset_at = Some(now + Duration::from_millis(update.request_reset_ms));
        state.token_reset_at = Some(now + Duration::from_millis(update.token_reset_ms));
        state.request_reset_done = false;
        state.token_reset_done = false;

        debug!(
            requests_remaining = update.requests_remaining,
            tokens_remaining = update.tokens_remaining,
            request_reset = %format_duration_ms(update.request_reset_ms),
            token_reset = %format_duration_ms(update.token_reset_ms),
            "rate-limit budgets updated from response headers"
        );
    }

    /// Current `(requests, tokens)` remaining.
    pub fn remaining(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.requests_remaining, state.tokens_remaining)
    }
}

impl Default for RateLimitLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a rate-limit reset duration into milliseconds.
///
/// Accepts `<N>ms`, or a composed form `[<D>d][<H>h][<M>m][<S>[.<FFF>]s][<N>ms]`
/// where every segment is optional but they appear in that order. Fractional
/// seconds carry up to three digits and are normalised by value: a fraction
/// below 10 counts as tenths, below 100 as hundredths, anything else is taken
/// as milliseconds verbatim.
///
/// Returns `None` on anything outside that grammar.
pub fn parse_duration_ms(input: &str) -> Option<u64> {
    fn digits(s: &[u8], pos: &mut usize) -> Option<u64> {
        let start = *pos;
        while *pos < s.len() && s[*pos].is_ascii_digit() {
            *pos += 1;
        }
        if *pos == start {
            return None;
        }
        std::str::from_utf8(&s[start..*pos]).ok()?.parse().ok()
    }

    let s = input.trim().as_bytes();
    if s.is_empty() {
        return None;
    }

    let mut pos = 0;
    let mut total: u64 = 0;
    let mut any = false;

    // days
    let mark = pos;
    if let Some(n) = digits(s, &mut pos) {
        if pos < s.len() && s[pos] == b'd' {
            pos += 1;
            total = total.checked_add(n.checked_mul(86_400_000)?)?;
            any = true;
        } else {
            pos = mark;
        }
    }

    // hours
    let mark = pos;
    if let Some(n) = digits(s, &mut pos) {
        if pos < s.len() && s[pos] == b'h' {
            pos += 1;
            total = total.checked_add(n.checked_mul(3_600_000)?)?;
            any = true;
        } else {
            pos = mark;
        }
    }

    // minutes; a lone 'm' only, "ms" belongs to the millisecond segment
    let mark = pos;
    if let Some(n) = digits(s, &mut pos) {
        if pos < s.len() && s[pos] == b'm' && s.get(pos + 1) != Some(&b's') {
            pos += 1;
            total = total.checked_add(n.checked_mul(60_000)?)?;
            any = true;
        } else {
            pos = mark;
        }
    }

    // seconds, with an optional fractional part of up to three digits
    let mark = pos;
    if let Some(n) = digits(s, &mut pos) {
        let mut matched = false;
        let mut frac: u64 = 0;

        if pos < s.len() && s[pos] == b'.' {
            let frac_start = pos + 1;
            let mut frac_end = frac_start;
            while frac_end < s.len() && s[frac_end].is_ascii_digit() {
                frac_end += 1;
            }
            let len = frac_end - frac_start;
            if (1..=3).contains(&len) && frac_end < s.len() && s[frac_end] == b's' {
                frac = std::str::from_utf8(&s[frac_start..frac_end])
                    .ok()?
                    .parse()
                    .ok()?;
                if frac < 10 {
                    frac *= 100;
                } else if frac < 100 {
                    frac *= 10;
                }
                pos = frac_end + 1;
                matched = true;
            }
        } else if pos < s.len() && s[pos] == b's' {
            pos += 1;
            matched = true;
        }

        if matched {
            total = total.checked_add(n.checked_mul(1000)?.checked_add(frac)?)?;
            any = true;
        } else {
            pos = mark;
        }
    }

    // trailing milliseconds
    let mark = pos;
    if let Some(n) = digits(s, &mut pos) {
        if pos + 1 < s.len() && s[pos] == b'm' && s[pos + 1] == b's' {
            pos += 2;
            total = total.checked_add(n)?;
            any = true;
        } else {
            pos = mark;
        }
    }

    if any && pos == s.len() {
        Some(total)
    } else {
        None
    }
}

/// Render a millisecond count in the shortest form the parser accepts.
pub fn format_duration_ms(ms: u64) -> String {
    if ms != 0 && ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn update(
        requests_remaining: u64,
        tokens_remaining: u64,
        request_reset_ms: u64,
        token_reset_ms: u64,
    ) -> RateLimitUpdate {
        RateLimitUpdate {
            request_limit: 100,
            token_limit: 10_000,
            requests_remaining,
            tokens_remaining,
            request_reset_ms,
            token_reset_ms,
        }
    }

    #[test]
    fn test_duration_grammar() {
        let cases = [
            ("500ms", 500),
            ("1s", 1000),
            ("2m30s", 150_000),
            ("1h", 3_600_000),
            ("1s200ms", 1200),
            ("1.2s", 1200),
            ("2.5s", 2500),
            ("2.50s", 2500),
            ("2.500s", 2500),
            ("6m0s", 360_000),
            ("10m", 600_000),
            ("10m0s", 600_000),
            ("600s", 600_000),
            ("600000ms", 600_000),
            ("1d", 86_400_000),
            ("1d2h3m4s", 93_784_000),
            ("0s", 0),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_duration_ms(input), Some(expected), "input {input:?}");
        }
    }

    #[test]
    fn test_duration_fraction_passthrough() {
        // Three-digit fractions at or above 100 are taken as milliseconds.
        assert_eq!(parse_duration_ms("1.100s"), Some(1100));
        // Leading zeros keep the value-based normalisation.
        assert_eq!(parse_duration_ms("1.010s"), Some(1100));
    }

    #[test]
    fn test_duration_rejects_garbage() {
        for input in ["", "s", "ms", "12", "1x", "30s2m", "1.2345s", "1..2s", "1m s"] {
            assert_eq!(parse_duration_ms(input), None, "input {input:?}");
        }
    }

    #[test]
    fn test_duration_round_trip() {
        for ms in [1, 500, 999, 1000, 2500, 60_000, 600_000] {
            let rendered = format_duration_ms(ms);
            assert_eq!(parse_duration_ms(&rendered), Some(ms), "rendered {rendered:?}");
        }
    }

    #[test]
    fn test_estimate_tokens_truncates() {
        assert_eq!(estimate_tokens("", 0.3), 0);
        assert_eq!(estimate_tokens("ab", 0.3), 0);
        assert_eq!(estimate_tokens("hello there", 0.3), 3);
        assert_eq!(estimate_tokens("hello", 1.0), 5);
    }

    #[test]
    fn test_update_requires_all_six_headers() {
        let mut headers: Vec<(String, String)> = [
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-limit-tokens", "10000"),
            ("x-ratelimit-remaining-requests", "99"),
            ("x-ratelimit-remaining-tokens", "9900"),
            ("x-ratelimit-reset-requests", "6m0s"),
            ("x-ratelimit-reset-tokens", "500ms"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let update = RateLimitUpdate::from_headers(&headers).unwrap();
        assert_eq!(update.requests_remaining, 99);
        assert_eq!(update.tokens_remaining, 9900);
        assert_eq!(update.request_reset_ms, 360_000);
        assert_eq!(update.token_reset_ms, 500);

        headers.pop();
        assert_eq!(RateLimitUpdate::from_headers(&headers), None);
    }

    #[test]
    fn test_update_rejects_malformed_field() {
        let headers: Vec<(String, String)> = [
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-limit-tokens", "10000"),
            ("x-ratelimit-remaining-requests", "not-a-number"),
            ("x-ratelimit-remaining-tokens", "9900"),
            ("x-ratelimit-reset-requests", "6m0s"),
            ("x-ratelimit-reset-tokens", "500ms"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(RateLimitUpdate::from_headers(&headers), None);
    }

    #[tokio::test]
    async fn test_fresh_ledger_admits_immediately() {
        let ledger = RateLimitLedger::new();
        let abort = AtomicBool::new(false);

        assert!(ledger.admit(1_000_000, &abort).await);
    }

    #[tokio::test]
    async fn test_ingest_tracks_server_values() {
        let ledger = RateLimitLedger::new();
        ledger.ingest(update(42, 1234, 60_000, 60_000));

        assert_eq!(ledger.remaining(), (42, 1234));

        let abort = AtomicBool::new(false);
        assert!(ledger.admit(100, &abort).await);
        assert_eq!(ledger.remaining(), (41, 1134));
    }

    #[tokio::test]
    async fn test_admission_stalls_until_request_reset() {
        let ledger = RateLimitLedger::new();
        ledger.ingest(update(0, 10_000, 200, 60_000));

        let abort = AtomicBool::new(false);
        let start = Instant::now();
        assert!(ledger.admit(10, &abort).await);
        assert!(start.elapsed() >= Duration::from_millis(200));

        // Refilled to the limit, then one request debited.
        assert_eq!(ledger.remaining().0, 99);
    }

    #[tokio::test]
    async fn test_admission_stalls_until_token_reset() {
        let ledger = RateLimitLedger::new();
        ledger.ingest(update(100, 5, 60_000, 200));

        let abort = AtomicBool::new(false);
        let start = Instant::now();
        assert!(ledger.admit(50, &abort).await);
        assert!(start.elapsed() >= Duration::from_millis(200));

        assert_eq!(ledger.remaining(), (99, 10_000 - 50));
    }

    #[tokio::test]
    async fn test_exact_token_budget_is_not_enough() {
        let ledger = RateLimitLedger::new();
        ledger.ingest(update(100, 50, 60_000, 250));

        // remaining == estimate blocks until the reset refills the budget
        let abort = AtomicBool::new(false);
        let start = Instant::now();
        assert!(ledger.admit(50, &abort).await);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_admission_observes_abort() {
        let ledger = RateLimitLedger::new();
        ledger.ingest(update(0, 10_000, 3_600_000, 3_600_000));

        let abort = AtomicBool::new(true);
        assert!(!ledger.admit(1, &abort).await);
        assert_eq!(ledger.remaining().0, 0);
    }
}
