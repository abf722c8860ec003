//! Preference screen model.
//!
//! The screen is an ordered list of preference items, each in one of three
//! states. `Removed` is terminal for the lifetime of the screen: once an item
//! is removed no later call brings it back. All mutating operations are
//! idempotent and silently ignore unknown keys.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Visibility state of a preference item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Hidden,
    Visible,
    Removed,
}

impl ItemState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Visible => "visible",
            Self::Removed => "removed",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hidden" => Ok(Self::Hidden),
            "visible" => Ok(Self::Visible),
            "removed" => Ok(Self::Removed),
            _ => Err(format!(
                "unknown item state: {s}. Expected one of: hidden, visible, removed"
            )),
        }
    }
}

/// Keys of the standard settings items.
pub mod keys {
    pub const DARK_THEME: &str = "dark_theme";
    pub const TOOLS_INSTALLER: &str = "tools_installer";
    pub const RESTORE_ON_BOOT: &str = "restore_on_boot";
    pub const MULTIPLE_TUNNELS: &str = "multiple_tunnels";
    pub const MODULE_DOWNLOADER: &str = "module_downloader";
    pub const KERNEL_MODULE_DISABLER: &str = "kernel_module_disabler";
    pub const ZIP_EXPORTER: &str = "zip_exporter";
    pub const LOG_VIEWER: &str = "log_viewer";
}

/// The UI side of item visibility.
pub trait PreferenceSurface: Send {
    /// Show or hide an item. No effect on removed or unknown items.
    fn set_visible(&mut self, key: &str, visible: bool);

    /// Remove an item permanently. No effect if already removed or unknown.
    fn remove(&mut self, key: &str);

    /// Current state, or `None` for unknown keys.
    fn state(&self, key: &str) -> Option<ItemState>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PreferenceItem {
    key: String,
    title: String,
    state: ItemState,
    transitions: u32,
}

/// Ordered list of preference items.
#[derive(Debug, Clone, Default)]
pub struct PreferenceScreen {
    items: Vec<PreferenceItem>,
}

impl PreferenceScreen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The settings screen's item list, every item initially visible.
    #[must_use]
    pub fn standard() -> Self {
        let mut screen = Self::new();
        screen.push(keys::DARK_THEME, "Use dark theme");
        screen.push(keys::TOOLS_INSTALLER, "Install command line tools");
        screen.push(keys::RESTORE_ON_BOOT, "Restore on boot");
        screen.push(keys::MULTIPLE_TUNNELS, "Allow multiple simultaneous tunnels");
        screen.push(keys::MODULE_DOWNLOADER, "Download and install kernel module");
        screen.push(keys::KERNEL_MODULE_DISABLER, "Disable kernel module backend");
        screen.push(keys::ZIP_EXPORTER, "Export tunnels to zip file");
        screen.push(keys::LOG_VIEWER, "View application log");
        screen
    }

    /// Append a visible item. Duplicate keys are ignored.
    pub fn push(&mut self, key: impl Into<String>, title: impl Into<String>) -> &mut Self {
        let key = key.into();
        if self.find(&key).is_none() {
            self.items.push(PreferenceItem {
                key,
                title: title.into(),
                state: ItemState::Visible,
                transitions: 0,
            });
        }
        self
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|item| item.key == key)
    }

    fn transition(&mut self, key: &str, to: ItemState) {
        let Some(idx) = self.find(key) else {
            trace!(item = key, "ignoring state change for unknown item");
            return;
        };
        let item = &mut self.items[idx];
        if item.state == ItemState::Removed || item.state == to {
            return;
        }
        trace!(item = key, from = %item.state, to = %to, "item state change");
        item.state = to;
        item.transitions += 1;
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    #[must_use]
    pub fn title(&self, key: &str) -> Option<&str> {
        self.find(key).map(|idx| self.items[idx].title.as_str())
    }

    /// Number of state changes the item has gone through.
    #[must_use]
    pub fn transitions(&self, key: &str) -> u32 {
        self.find(key).map_or(0, |idx| self.items[idx].transitions)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.key.as_str())
    }

    /// Keys of items currently in `state`, in screen order.
    #[must_use]
    pub fn keys_in(&self, state: ItemState) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| item.state == state)
            .map(|item| item.key.as_str())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> ScreenSnapshot {
        ScreenSnapshot {
            items: self
                .items
                .iter()
                .map(|item| ItemSnapshot {
                    key: item.key.clone(),
                    title: item.title.clone(),
                    state: item.state,
                    transitions: item.transitions,
                })
                .collect(),
        }
    }
}

impl PreferenceSurface for PreferenceScreen {
    fn set_visible(&mut self, key: &str, visible: bool) {
        let to = if visible {
            ItemState::Visible
        } else {
            ItemState::Hidden
        };
        self.transition(key, to);
    }

    fn remove(&mut self, key: &str) {
        self.transition(key, ItemState::Removed);
    }

    fn state(&self, key: &str) -> Option<ItemState> {
        self.find(key).map(|idx| self.items[idx].state)
    }
}

/// Serializable view of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub key: String,
    pub title: String,
    pub state: ItemState,
    pub transitions: u32,
}

/// Serializable view of the whole screen.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub items: Vec<ItemSnapshot>,
}

impl ScreenSnapshot {
    #[must_use]
    pub fn state(&self, key: &str) -> Option<ItemState> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.state)
    }

    /// Human-readable table, one item per line.
    #[must_use]
    pub fn render_plain(&self) -> String {
        let width = self.items.iter().map(|i| i.key.len()).max().unwrap_or(0);
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&format!(
                "{:<width$}  {:<7}  {}\n",
                item.key,
                item.state.as_str(),
                item.title
            ));
        }
        out
    }
}
