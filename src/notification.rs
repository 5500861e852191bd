//! Generic rendering of push payloads.
//!
//! The engine doesn't know what a notification is about; it only fills in
//! missing fields so the host can display something sensible.

use serde::{Deserialize, Serialize};

use crate::config::NotificationConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
  /// Page to open when the notification is clicked
  pub url: String,
  pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  url: Option<String>,
  tag: Option<String>,
}

impl Notification {
  /// Build a notification from a raw push payload.
  ///
  /// JSON objects supply any of the fields; anything else becomes the body.
  pub fn from_payload(payload: &[u8], defaults: &NotificationConfig) -> Self {
    let parsed = serde_json::from_slice::<PushPayload>(payload).unwrap_or_else(|_| {
      let text = String::from_utf8_lossy(payload).trim().to_string();
      PushPayload {
        body: (!text.is_empty()).then_some(text),
        ..Default::default()
      }
    });

    Self {
      title: parsed
        .title
        .unwrap_or_else(|| defaults.default_title.clone()),
      body: parsed.body.unwrap_or_default(),
      icon: parsed.icon.or_else(|| defaults.default_icon.clone()),
      badge: parsed.badge,
      url: parsed.url.unwrap_or_else(|| defaults.default_url.clone()),
      tag: parsed.tag,
    }
  }
}
