use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{GlobalState, ModalContext, Notification, Theme, User};

/// The complete mutation vocabulary of the state tree.
///
/// On the wire an action is `{"type": "SET_USER", "payload": ...}`; unit
/// actions carry no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalAction {
    SetUser(Option<User>),
    ClearUser,
    /// The entry is stamped by the dispatching instance so every replica
    /// stores the same id and timestamp.
    AddNotification(Notification),
    RemoveNotification {
        id: String,
    },
    SetModal(Option<ModalContext>),
    ClearModal,
    SetTheme(Theme),
    ToggleTheme,
    ResetState,
}

impl GlobalAction {
    pub fn name(&self) -> &'static str {
        match self {
            GlobalAction::SetUser(_) => "SET_USER",
            GlobalAction::ClearUser => "CLEAR_USER",
            GlobalAction::AddNotification(_) => "ADD_NOTIFICATION",
            GlobalAction::RemoveNotification { .. } => "REMOVE_NOTIFICATION",
            GlobalAction::SetModal(_) => "SET_MODAL",
            GlobalAction::ClearModal => "CLEAR_MODAL",
            GlobalAction::SetTheme(_) => "SET_THEME",
            GlobalAction::ToggleTheme => "TOGGLE_THEME",
            GlobalAction::ResetState => "RESET_STATE",
        }
    }
}

/// Bounds applied to the notification list on every insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub max_notifications: usize,
    pub default_ttl: Duration,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            max_notifications: 100,
            default_ttl: Duration::from_millis(60_000),
        }
    }
}

impl NotificationPolicy {
    fn is_expired(&self, entry: &Notification, now: DateTime<Utc>) -> bool {
        let ttl = entry
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_ttl);
        let age_ms = now.signed_duration_since(entry.timestamp).num_milliseconds();
        age_ms >= i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Pure transition function of the state tree.
#[derive(Debug, Clone)]
pub struct Reducer {
    defaults: GlobalState,
    policy: NotificationPolicy,
}

impl Reducer {
    pub fn new(defaults: GlobalState, policy: NotificationPolicy) -> Self {
        Self { defaults, policy }
    }

    pub fn defaults(&self) -> &GlobalState {
        &self.defaults
    }

    pub fn policy(&self) -> &NotificationPolicy {
        &self.policy
    }

    /// Compute the state following `action`. Fields the action does not
    /// touch are shared with `state`.
    pub fn reduce(&self, state: &GlobalState, action: GlobalAction, now: DateTime<Utc>) -> GlobalState {
        match action {
            GlobalAction::SetUser(user) => GlobalState {
                user: user.map(Arc::new),
                ..state.clone()
            },
            GlobalAction::ClearUser => GlobalState {
                user: None,
                ..state.clone()
            },
            GlobalAction::AddNotification(entry) => {
                let mut next: Vec<Notification> = state
                    .notifications
                    .iter()
                    .filter(|n| !self.policy.is_expired(n, now))
                    .cloned()
                    .collect();
                next.push(entry);
                let overflow = next.len().saturating_sub(self.policy.max_notifications);
                next.drain(..overflow);
                GlobalState {
                    notifications: Arc::new(next),
                    ..state.clone()
                }
            }
            GlobalAction::RemoveNotification { id } => {
                if !state.notifications.iter().any(|n| n.id == id) {
                    return state.clone();
                }
                let next = state
                    .notifications
                    .iter()
                    .filter(|n| n.id != id)
                    .cloned()
                    .collect();
                GlobalState {
                    notifications: Arc::new(next),
                    ..state.clone()
                }
            }
            GlobalAction::SetModal(context) => GlobalState {
                modal_context: context.map(Arc::new),
                ..state.clone()
            },
            GlobalAction::ClearModal => GlobalState {
                modal_context: None,
                ..state.clone()
            },
            GlobalAction::SetTheme(theme) => GlobalState {
                theme: Arc::new(theme),
                ..state.clone()
            },
            GlobalAction::ToggleTheme => {
                let theme = Theme {
                    mode: state.theme.mode.toggled(),
                    ..(*state.theme).clone()
                };
                GlobalState {
                    theme: Arc::new(theme),
                    ..state.clone()
                }
            }
            GlobalAction::ResetState => self.defaults.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{NotificationKind, ThemeMode};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn reducer() -> Reducer {
        Reducer::new(GlobalState::default(), NotificationPolicy::default())
    }

    fn note_at(message: &str, timestamp: DateTime<Utc>) -> Notification {
        Notification {
            timestamp,
            ..Notification::new(message, NotificationKind::Info)
        }
    }

    #[test]
    fn test_action_wire_format() {
        let raw = serde_json::to_value(GlobalAction::ToggleTheme).unwrap();
        assert_eq!(raw, json!({"type": "TOGGLE_THEME"}));

        let raw = serde_json::to_value(GlobalAction::RemoveNotification { id: "n1".into() }).unwrap();
        assert_eq!(raw, json!({"type": "REMOVE_NOTIFICATION", "payload": {"id": "n1"}}));

        let raw = serde_json::to_value(GlobalAction::SetUser(None)).unwrap();
        assert_eq!(raw, json!({"type": "SET_USER", "payload": null}));

        let action: GlobalAction = serde_json::from_value(json!({
            "type": "SET_THEME",
            "payload": {"mode": "dark", "primaryColor": "#000", "customCSS": ""}
        }))
        .unwrap();
        assert_eq!(action.name(), "SET_THEME");
    }

    #[test]
    fn test_set_and_clear_user() {
        let r = reducer();
        let s0 = GlobalState::default();
        let s1 = r.reduce(&s0, GlobalAction::SetUser(Some(User::new("u1", "Ada"))), Utc::now());
        assert_eq!(s1.user.as_ref().unwrap().name, "Ada");
        assert!(Arc::ptr_eq(&s0.theme, &s1.theme));

        let s2 = r.reduce(&s1, GlobalAction::ClearUser, Utc::now());
        assert!(s2.user.is_none());
    }

    #[test]
    fn test_set_theme_replaces_whole_theme() {
        let r = reducer();
        let theme = Theme {
            mode: ThemeMode::Dark,
            primary_color: "#ff0000".into(),
            custom_css: "body{}".into(),
        };
        let s = r.reduce(&GlobalState::default(), GlobalAction::SetTheme(theme.clone()), Utc::now());
        assert_eq!(*s.theme, theme);
    }

    #[test]
    fn test_toggle_theme_keeps_other_fields() {
        let r = reducer();
        let s0 = GlobalState {
            theme: Arc::new(Theme {
                primary_color: "#123456".into(),
                ..Theme::default()
            }),
            ..GlobalState::default()
        };
        let s1 = r.reduce(&s0, GlobalAction::ToggleTheme, Utc::now());
        assert_eq!(s1.theme.mode, ThemeMode::Dark);
        assert_eq!(s1.theme.primary_color, "#123456");

        let s2 = r.reduce(&s1, GlobalAction::ToggleTheme, Utc::now());
        assert_eq!(s2.theme.mode, ThemeMode::Light);
    }

    #[test]
    fn test_modal_lifecycle() {
        let r = reducer();
        let modal = ModalContext {
            source_app: "checkout".into(),
            data: json!({"orderId": 7}),
            metadata: Default::default(),
        };
        let s1 = r.reduce(&GlobalState::default(), GlobalAction::SetModal(Some(modal)), Utc::now());
        assert_eq!(s1.modal_context.as_ref().unwrap().source_app, "checkout");

        let s2 = r.reduce(&s1, GlobalAction::ClearModal, Utc::now());
        assert!(s2.modal_context.is_none());
    }

    #[test]
    fn test_notification_ttl_is_pruned_on_insert() {
        let r = reducer();
        let now = Utc::now();
        let mut s = GlobalState::default();

        s = r.reduce(&s, GlobalAction::AddNotification(note_at("old", now - ChronoDuration::seconds(120))), now);
        s = r.reduce(&s, GlobalAction::AddNotification(note_at("edge", now - ChronoDuration::seconds(60))), now);
        s = r.reduce(&s, GlobalAction::AddNotification(note_at("fresh", now - ChronoDuration::seconds(10))), now);

        // An entry exactly one TTL old counts as expired.
        assert_eq!(s.notifications.len(), 1);
        assert_eq!(s.notifications[0].message, "fresh");

        s = r.reduce(&s, GlobalAction::AddNotification(note_at("new", now)), now);
        let messages: Vec<&str> = s.notifications.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["fresh", "new"]);

        // "fresh" is now past its TTL but stays until something is inserted.
        let later = now + ChronoDuration::seconds(55);
        s = r.reduce(&s, GlobalAction::ToggleTheme, later);
        s = r.reduce(&s, GlobalAction::RemoveNotification { id: "missing".into() }, later);
        assert_eq!(s.notifications.len(), 2);

        s = r.reduce(&s, GlobalAction::AddNotification(note_at("later", later)), later);
        let messages: Vec<&str> = s.notifications.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["new", "later"]);
    }

    #[test]
    fn test_per_entry_ttl() {
        let r = reducer();
        let now = Utc::now();
        let short = Notification {
            ttl_ms: Some(1_000),
            ..note_at("short", now - ChronoDuration::seconds(5))
        };
        let mut s = r.reduce(&GlobalState::default(), GlobalAction::AddNotification(short), now);
        s = r.reduce(&s, GlobalAction::AddNotification(note_at("next", now)), now);
        assert_eq!(s.notifications.len(), 1);
        assert_eq!(s.notifications[0].message, "next");
    }

    #[test]
    fn test_notification_cap_keeps_most_recent() {
        let r = Reducer::new(
            GlobalState::default(),
            NotificationPolicy {
                max_notifications: 3,
                ..NotificationPolicy::default()
            },
        );
        let now = Utc::now();
        let mut s = GlobalState::default();
        for i in 0..5 {
            s = r.reduce(&s, GlobalAction::AddNotification(note_at(&format!("n{i}"), now)), now);
            assert!(s.notifications.len() <= 3);
        }
        let messages: Vec<&str> = s.notifications.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn test_remove_notification() {
        let r = reducer();
        let now = Utc::now();
        let keep = note_at("keep", now);
        let drop = note_at("drop", now);
        let drop_id = drop.id.clone();

        let mut s = r.reduce(&GlobalState::default(), GlobalAction::AddNotification(keep), now);
        s = r.reduce(&s, GlobalAction::AddNotification(drop), now);
        s = r.reduce(&s, GlobalAction::RemoveNotification { id: drop_id }, now);
        assert_eq!(s.notifications.len(), 1);
        assert_eq!(s.notifications[0].message, "keep");

        let before = Arc::clone(&s.notifications);
        let s = r.reduce(&s, GlobalAction::RemoveNotification { id: "missing".into() }, now);
        assert!(Arc::ptr_eq(&before, &s.notifications));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let r = reducer();
        let mut s = r.reduce(&GlobalState::default(), GlobalAction::SetUser(Some(User::new("u", "U"))), Utc::now());
        s = r.reduce(&s, GlobalAction::ToggleTheme, Utc::now());
        s = r.reduce(&s, GlobalAction::ResetState, Utc::now());

        assert!(s.user.is_none());
        assert!(Arc::ptr_eq(&s.theme, &r.defaults().theme));
        assert_eq!(s.theme.mode, ThemeMode::Light);
    }
}
