use mailpreview_core::DEFAULT_TEMPLATE_PREFIX;
use thiserror::Error;

use crate::{
    gateway::ProviderConfig,
    storage::{LocalStore, StoreError},
};

pub const EMAILS_KEY: &str = "emails";
pub const PREFIX_KEY: &str = "prefix";

const MAX_EMAIL_LEN: usize = 254;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PanelError {
    #[error("invalid email address {0:?}")]
    InvalidEmail(String),
}

/// Test recipients and the template naming prefix, as the user saved them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    pub emails: Vec<String>,
    pub prefix: String,
}

impl Preferences {
    pub fn load(store: &LocalStore) -> Self {
        Self {
            emails: store.get::<Vec<String>>(EMAILS_KEY).unwrap_or_default(),
            prefix: store.get::<String>(PREFIX_KEY).unwrap_or_default(),
        }
    }

    /// Prefix sent to publish/changed calls; the backend's default when unset.
    pub fn template_prefix(&self) -> &str {
        let prefix = self.prefix.trim();
        if prefix.is_empty() {
            DEFAULT_TEMPLATE_PREFIX
        } else {
            prefix
        }
    }
}

/// Edit session over the stored preferences. Nothing reaches storage until
/// `save`; `cancel` throws the draft away.
#[derive(Debug)]
pub struct ConfigPanel {
    saved: Preferences,
    draft: Preferences,
    providers: Option<ProviderConfig>,
}

impl ConfigPanel {
    pub fn open(store: &LocalStore) -> Self {
        let saved = Preferences::load(store);
        Self {
            draft: saved.clone(),
            saved,
            providers: None,
        }
    }

    pub fn draft(&self) -> &Preferences {
        &self.draft
    }

    pub fn providers(&self) -> Option<&ProviderConfig> {
        self.providers.as_ref()
    }

    pub fn set_providers(&mut self, providers: ProviderConfig) {
        self.providers = Some(providers);
    }

    pub fn is_dirty(&self) -> bool {
        self.draft != self.saved
    }

    /// Returns `false` when the address was already in the list.
    pub fn add_email(&mut self, raw: &str) -> Result<bool, PanelError> {
        let email = raw.trim();
        if !is_plausible_email(email) {
            return Err(PanelError::InvalidEmail(raw.to_owned()));
        }
        if self
            .draft
            .emails
            .iter()
            .any(|known| known.eq_ignore_ascii_case(email))
        {
            return Ok(false);
        }
        self.draft.emails.push(email.to_owned());
        Ok(true)
    }

    pub fn remove_email(&mut self, email: &str) -> bool {
        let email = email.trim();
        let before = self.draft.emails.len();
        self.draft
            .emails
            .retain(|known| !known.eq_ignore_ascii_case(email));
        self.draft.emails.len() != before
    }

    pub fn set_prefix(&mut self, prefix: &str) {
        self.draft.prefix = prefix.trim().to_owned();
    }

    /// Commits both fields in one write. On failure the draft is kept so the
    /// caller can leave the panel open and retry.
    pub fn save(&mut self, store: &mut LocalStore) -> Result<Preferences, StoreError> {
        let emails = serde_json::to_value(&self.draft.emails).map_err(StoreError::Serialize)?;
        let prefix = serde_json::to_value(&self.draft.prefix).map_err(StoreError::Serialize)?;
        store.set_all([(EMAILS_KEY, emails), (PREFIX_KEY, prefix)])?;
        self.saved = self.draft.clone();
        Ok(self.saved.clone())
    }

    /// Closes the panel, returning the preferences that are still in effect.
    pub fn cancel(self) -> Preferences {
        self.saved
    }
}

fn is_plausible_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace)
    {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = LocalStore::open(dir.path().join("storage.json")).expect("open store");
        (dir, store)
    }

    #[test]
    fn save_persists_both_fields() {
        let (_dir, mut store) = temp_store();
        let mut panel = ConfigPanel::open(&store);
        assert!(panel.add_email(" qa@example.com ").unwrap());
        panel.set_prefix("STAGE");
        assert!(panel.is_dirty());

        let saved = panel.save(&mut store).unwrap();
        assert_eq!(saved.emails, vec!["qa@example.com".to_owned()]);

        let reloaded = Preferences::load(&store);
        assert_eq!(reloaded, saved);
        assert_eq!(reloaded.template_prefix(), "STAGE");
    }

    #[test]
    fn cancel_discards_edits() {
        let (_dir, mut store) = temp_store();
        store.set(EMAILS_KEY, &vec!["kept@example.com"]).unwrap();

        let mut panel = ConfigPanel::open(&store);
        panel.add_email("dropped@example.com").unwrap();
        panel.remove_email("kept@example.com");
        let still = panel.cancel();

        assert_eq!(still.emails, vec!["kept@example.com".to_owned()]);
        assert_eq!(Preferences::load(&store), still);
    }

    #[test]
    fn rejects_malformed_and_ignores_duplicate_addresses() {
        let (_dir, store) = temp_store();
        let mut panel = ConfigPanel::open(&store);

        assert_eq!(
            panel.add_email("nobody"),
            Err(PanelError::InvalidEmail("nobody".to_owned()))
        );
        assert!(panel.add_email("a b@example.com").is_err());
        assert!(panel.add_email("a@example.com").unwrap());
        assert!(!panel.add_email("A@Example.com").unwrap());
        assert_eq!(panel.draft().emails.len(), 1);
    }

    #[test]
    fn failed_save_keeps_draft_and_stored_values() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("storage.json");
        std::fs::create_dir(&path).expect("create blocking dir");
        let mut store = LocalStore::open_or_empty(&path);

        let mut panel = ConfigPanel::open(&store);
        panel.add_email("qa@example.com").unwrap();
        panel.set_prefix("QA");

        assert!(panel.save(&mut store).is_err());
        assert_eq!(Preferences::load(&store), Preferences::default());
        assert!(panel.is_dirty());
        assert_eq!(panel.draft().emails, vec!["qa@example.com".to_owned()]);
    }

    #[test]
    fn empty_prefix_falls_back_to_default() {
        assert_eq!(Preferences::default().template_prefix(), "DEV");
    }
}
