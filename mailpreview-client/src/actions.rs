use mailpreview_core::FileRecord;
use tracing::{info, warn};

use crate::{
    config_panel::Preferences,
    gateway::{Gateway, PublishStatus, SendResult},
};

pub const NO_ADDRESSES_MESSAGE: &str = "No Email Addresses Configured";

/// Message reporting the outcome of an action, printed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub text: String,
}

impl Notification {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// One `email: status` line per recipient, in the order the backend answered.
pub fn summarize_send_results(results: &[SendResult]) -> String {
    results
        .iter()
        .map(|result| format!("{}: {}\n", result.email, result.status))
        .collect()
}

/// Sends the selected template to the configured recipients.
///
/// With nothing selected or no recipients the request is never made. A
/// transport failure is logged and yields no notification.
pub async fn send_test(
    gateway: &Gateway,
    selected: Option<&FileRecord>,
    prefs: &Preferences,
) -> Option<Notification> {
    let Some(record) = selected.filter(|_| !prefs.emails.is_empty()) else {
        return Some(Notification::new(NO_ADDRESSES_MESSAGE));
    };

    match gateway.send_test_email(&record.id, &prefs.emails).await {
        Ok(results) => {
            info!(id = %record.id, recipients = results.len(), "test email sent");
            Some(Notification::new(summarize_send_results(&results)))
        }
        Err(err) => {
            warn!(id = %record.id, "test email failed: {err}");
            None
        }
    }
}

pub async fn check_changed(
    gateway: &Gateway,
    selected: Option<&FileRecord>,
    prefs: &Preferences,
) -> Option<Notification> {
    let record = selected?;
    let prefix = prefs.template_prefix();
    match gateway.is_changed(&record.id, prefix).await {
        Ok(true) => Some(Notification::new(format!(
            "{} differs from the published {prefix} template",
            record.name
        ))),
        Ok(false) => Some(Notification::new(format!(
            "{} matches the published {prefix} template",
            record.name
        ))),
        Err(err) => {
            warn!(id = %record.id, prefix, "change check failed: {err}");
            None
        }
    }
}

pub async fn publish(
    gateway: &Gateway,
    selected: Option<&FileRecord>,
    prefs: &Preferences,
) -> Option<Notification> {
    let record = selected?;
    let prefix = prefs.template_prefix();
    match gateway.publish(&record.id, prefix).await {
        Ok(status) => {
            info!(id = %record.id, prefix, ?status, "template published");
            let outcome = match status {
                PublishStatus::NoChange => "unchanged",
                PublishStatus::Added => "added",
                PublishStatus::Updated => "updated",
            };
            Some(Notification::new(format!(
                "{} {outcome} as {prefix} template",
                record.name
            )))
        }
        Err(err) => {
            warn!(id = %record.id, prefix, "publish failed: {err}");
            None
        }
    }
}
