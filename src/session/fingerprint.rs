use rand::Rng;

/// Common desktop user agents.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

/// Common viewport sizes.
const VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1366, 768), (1536, 864), (1440, 900)];

/// Identity presented by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserFingerprint {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub accept_language: String,
}

impl BrowserFingerprint {
    /// Random user agent and viewport.
    pub fn randomized() -> Self {
        let mut rng = rand::thread_rng();
        let ua = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
        let (width, height) = VIEWPORTS[rng.gen_range(0..VIEWPORTS.len())];
        Self {
            user_agent: ua.to_string(),
            viewport_width: width,
            viewport_height: height,
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }

    /// Stable identity, used when user-agent rotation is off.
    pub fn fixed(width: u32, height: u32) -> Self {
        Self {
            user_agent: USER_AGENTS[0].to_string(),
            viewport_width: width,
            viewport_height: height,
            accept_language: "en-US,en;q=0.9".to_string(),
        }
    }
}
