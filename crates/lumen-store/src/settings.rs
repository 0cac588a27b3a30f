use std::sync::Arc;

use lumen_core::{LumenError, ModelCatalog, SelectedSettings, Theme};
use tracing::{debug, warn};

use crate::KeyValueStore;

/// Reads and writes `SelectedSettings` through a `KeyValueStore`.
///
/// Writes happen only on explicit user action; nothing here is called from
/// lifecycle transitions.
pub struct SettingsService {
    store: Arc<dyn KeyValueStore>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stored settings, defaulting absent or stale values deterministically.
    pub fn load(
        &self,
        catalog: &ModelCatalog,
        system_theme: Theme,
    ) -> lumen_core::Result<SelectedSettings> {
        let first = catalog
            .first()
            .ok_or_else(|| LumenError::Validation("model catalog is empty".into()))?;

        let model_id = match self.store.get(keys::SELECTED_MODEL)? {
            Some(id) if catalog.contains(&id) => id,
            Some(id) => {
                warn!(stored = %id, fallback = %first.id, "Stored model not in catalog");
                first.id.clone()
            }
            None => first.id.clone(),
        };

        let theme = self.theme(system_theme)?;

        debug!(model = %model_id, theme = %theme, "Settings loaded");
        Ok(SelectedSettings { model_id, theme })
    }

    /// Stored theme, or `system_theme` when absent or unreadable.
    pub fn theme(&self, system_theme: Theme) -> lumen_core::Result<Theme> {
        let theme = match self.store.get(keys::THEME)? {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{}, using system theme", e);
                system_theme
            }),
            None => system_theme,
        };
        Ok(theme)
    }

    pub fn save_model(&self, model_id: &str) -> lumen_core::Result<()> {
        self.store.set(keys::SELECTED_MODEL, model_id)?;
        Ok(())
    }

    pub fn save_theme(&self, theme: Theme) -> lumen_core::Result<()> {
        self.store.set(keys::THEME, theme.as_str())?;
        Ok(())
    }
}

// Well-known setting keys
pub mod keys {
    pub const SELECTED_MODEL: &str = "selected_model";
    pub const THEME: &str = "theme";
}
