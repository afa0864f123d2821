//! Opening the authorization page.
//!
//! The flow never talks to a browser directly: it asks a [`PopupLauncher`]
//! for a window and treats `None` as "blocked", falling back to exposing the
//! URL for a manual link.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::{debug, warn};

pub const DEFAULT_POPUP_FEATURES: &str = "width=500,height=600,resizable=yes,scrollbars=yes";

const DEFAULT_WIDTH: u32 = 500;
const DEFAULT_HEIGHT: u32 = 600;

/// Parsed window-features string (`width=500,height=600,resizable=yes`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupFeatures {
    pub width: u32,
    pub height: u32,
    pub left: Option<u32>,
    pub top: Option<u32>,
    /// Remaining `key=value` pairs, kept in order of key.
    pub flags: BTreeMap<String, String>,
}

impl Default for PopupFeatures {
    fn default() -> Self {
        Self::parse(DEFAULT_POPUP_FEATURES)
    }
}

impl PopupFeatures {
    /// Lenient parse: unknown keys are kept as flags, malformed sizes fall
    /// back to the defaults.
    #[must_use]
    pub fn parse(features: &str) -> Self {
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut left = None;
        let mut top = None;
        let mut flags = BTreeMap::new();

        for part in features.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').unwrap_or((part, "yes"));
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "width" => width = value.parse().unwrap_or(DEFAULT_WIDTH),
                "height" => height = value.parse().unwrap_or(DEFAULT_HEIGHT),
                "left" => left = value.parse().ok(),
                "top" => top = value.parse().ok(),
                _ => {
                    flags.insert(key, value.to_string());
                },
            }
        }

        Self {
            width,
            height,
            left,
            top,
            flags,
        }
    }

    /// Position the window in the middle of a `screen_width` x `screen_height`
    /// screen. Windows larger than the screen are pinned to the top-left.
    #[must_use]
    pub fn centered(mut self, screen_width: u32, screen_height: u32) -> Self {
        self.left = Some(screen_width.saturating_sub(self.width) / 2);
        self.top = Some(screen_height.saturating_sub(self.height) / 2);
        self
    }

    /// Render back to a features string.
    #[must_use]
    pub fn to_features_string(&self) -> String {
        let mut parts = vec![
            format!("width={}", self.width),
            format!("height={}", self.height),
        ];
        if let Some(left) = self.left {
            parts.push(format!("left={left}"));
        }
        if let Some(top) = self.top {
            parts.push(format!("top={top}"));
        }
        parts.extend(self.flags.iter().map(|(k, v)| format!("{k}={v}")));
        parts.join(",")
    }
}

/// A window showing the authorization page.
pub trait PopupWindow: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Opens the authorization page. `None` means the window could not be
/// opened (blocked, no display, no browser).
pub trait PopupLauncher: Send + Sync {
    fn open(&self, url: &str, features: &PopupFeatures) -> Option<Box<dyn PopupWindow>>;
}

// ── System browser ──────────────────────────────────────────────────────────

/// Opens the URL in the default browser. The tab is out of our control, so
/// `close` only marks it closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

struct BrowserTab {
    closed: AtomicBool,
}

impl PopupWindow for BrowserTab {
    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl PopupLauncher for SystemBrowser {
    fn open(&self, url: &str, features: &PopupFeatures) -> Option<Box<dyn PopupWindow>> {
        debug!(features = %features.to_features_string(), "opening authorization page in browser");
        match open::that(url) {
            Ok(()) => Some(Box::new(BrowserTab {
                closed: AtomicBool::new(false),
            })),
            Err(e) => {
                warn!(error = %e, "failed to open browser");
                None
            },
        }
    }
}

// ── Blocked ─────────────────────────────────────────────────────────────────

/// A launcher that never opens anything: every flow goes to the manual link.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockedPopup;

impl PopupLauncher for BlockedPopup {
    fn open(&self, _url: &str, _features: &PopupFeatures) -> Option<Box<dyn PopupWindow>> {
        None
    }
}
