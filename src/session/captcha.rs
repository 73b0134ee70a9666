//! CAPTCHA and bot-wall detection on fetched pages.
//!
//! Detection only. A hit is reported as `ScrapeError::Captcha`, which bans
//! the proxy and triggers one retry on a fresh session.

use std::fmt;

/// Bodies shorter than this that mention bots or security are treated as a
/// bot-check interstitial.
const SHORT_BODY_LEN: usize = 1000;

const HCAPTCHA: &[&str] = &["hcaptcha.com", "h-captcha"];
const RECAPTCHA: &[&str] = &["google.com/recaptcha", "g-recaptcha", "data-sitekey"];
const CLOUDFLARE: &[&str] = &["cf-challenge", "cf_chl_captcha", "cf-browser-verification", "challenge-platform"];
const AKAMAI: &[&str] = &["id=\"ak_js\"", "_abck", "bot-detection"];
const GENERIC: &[&str] = &[
    "captcha",
    "robot check",
    "verify you are human",
    "please verify",
    "security check",
];
const SHORT_BODY_WORDS: &[&str] = &["bot", "robot", "security", "automated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    Cloudflare,
    Akamai,
    Generic,
    BotCheck,
}

impl fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptchaKind::Recaptcha => "recaptcha",
            CaptchaKind::Hcaptcha => "hcaptcha",
            CaptchaKind::Cloudflare => "cloudflare",
            CaptchaKind::Akamai => "akamai",
            CaptchaKind::Generic => "generic",
            CaptchaKind::BotCheck => "bot-check",
        };
        f.write_str(s)
    }
}

/// Classify a response body, `None` when it looks like real content.
pub fn detect(body: &str) -> Option<CaptchaKind> {
    let lower = body.to_lowercase();
    let hit = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if hit(HCAPTCHA) {
        return Some(CaptchaKind::Hcaptcha);
    }
    if hit(RECAPTCHA) {
        return Some(CaptchaKind::Recaptcha);
    }
    if hit(CLOUDFLARE) {
        return Some(CaptchaKind::Cloudflare);
    }
    if hit(AKAMAI) {
        return Some(CaptchaKind::Akamai);
    }
    if hit(GENERIC) {
        return Some(CaptchaKind::Generic);
    }

    // JSON payloads are data, not interstitials.
    let trimmed = lower.trim_start();
    if lower.len() < SHORT_BODY_LEN && !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        let mentions_bot = lower
            .split(|c: char| !c.is_ascii_alphabetic())
            .any(|w| SHORT_BODY_WORDS.contains(&w));
        if mentions_bot {
            return Some(CaptchaKind::BotCheck);
        }
    }
    None
}
