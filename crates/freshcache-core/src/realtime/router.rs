use std::collections::HashMap;

use serde_json::json;
use tracing::debug;

use super::event::{DataAction, DataUpdate, InboundEvent};
use crate::cache::{CacheStore, KeyPart, QueryKey};
use crate::notifications::{
    Notification, NotificationCategory, NotificationKind, NotificationPriority, NotificationSink,
};
use crate::query_key;

/// A cache key to invalidate for an entity, optionally suffixed with the
/// event's id.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTemplate {
    key: QueryKey,
    append_id: bool,
}

impl KeyTemplate {
    pub fn fixed(key: QueryKey) -> Self {
        Self { key, append_id: false }
    }

    pub fn with_id(key: QueryKey) -> Self {
        Self { key, append_id: true }
    }

    fn resolve(&self, id: &KeyPart) -> QueryKey {
        if self.append_id {
            self.key.clone().with(id.clone())
        } else {
            self.key.clone()
        }
    }
}

/// User-facing notice derived from a data update. `{id}` in the message is
/// replaced with the entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTemplate {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub category: NotificationCategory,
    pub priority: NotificationPriority,
}

impl AlertTemplate {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        category: NotificationCategory,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind: NotificationKind::Info,
            category,
            priority: NotificationPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    fn render(&self, update: &DataUpdate) -> Notification {
        let id = match &update.id {
            KeyPart::Int(n) => n.to_string(),
            KeyPart::Str(s) => s.clone(),
        };
        Notification::new(self.kind, self.title.clone(), self.message.replace("{id}", &id))
            .with_category(self.category)
            .with_priority(self.priority)
            .with_metadata(json!({
                "entity": update.entity,
                "action": update.action,
                "id": update.id,
            }))
    }
}

/// What routing one event did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOutcome {
    pub invalidated: Vec<QueryKey>,
    pub notification: Option<Notification>,
    /// The event targeted other users and was ignored.
    pub dropped: bool,
}

/// Translates push events into cache invalidations and notifications.
#[derive(Debug, Clone)]
pub struct EventRouter {
    routes: HashMap<String, Vec<KeyTemplate>>,
    alerts: HashMap<(String, DataAction), AlertTemplate>,
    presence: Vec<QueryKey>,
}

impl Default for EventRouter {
    fn default() -> Self {
        use NotificationCategory as Cat;

        Self::empty()
            .route(
                "quiz",
                [
                    KeyTemplate::fixed(query_key!["quizzes"]),
                    KeyTemplate::with_id(query_key!["quiz"]),
                ],
            )
            .route(
                "enrollment",
                [
                    KeyTemplate::fixed(query_key!["enrollments"]),
                    KeyTemplate::with_id(query_key!["enrollment"]),
                    KeyTemplate::fixed(query_key!["dashboard"]),
                ],
            )
            .route(
                "course",
                [
                    KeyTemplate::fixed(query_key!["courses"]),
                    KeyTemplate::with_id(query_key!["course"]),
                ],
            )
            .route(
                "user",
                [
                    KeyTemplate::fixed(query_key!["users"]),
                    KeyTemplate::with_id(query_key!["user"]),
                ],
            )
            .route(
                "grade",
                [
                    KeyTemplate::fixed(query_key!["grades"]),
                    KeyTemplate::with_id(query_key!["grade"]),
                    KeyTemplate::fixed(query_key!["dashboard"]),
                ],
            )
            .route("settings", [KeyTemplate::fixed(query_key!["settings"])])
            .route("notification", [KeyTemplate::fixed(query_key!["notifications"])])
            .alert(
                "quiz",
                DataAction::Created,
                AlertTemplate::new("New Quiz Available", "A new quiz has been published", Cat::Quiz)
                    .with_priority(NotificationPriority::High),
            )
            .alert(
                "quiz",
                DataAction::Updated,
                AlertTemplate::new("Quiz Updated", "Quiz {id} has been updated", Cat::Quiz),
            )
            .alert(
                "enrollment",
                DataAction::Created,
                AlertTemplate::new(
                    "New Enrollment",
                    "You have been enrolled in a new course",
                    Cat::Enrollment,
                ),
            )
            .alert(
                "course",
                DataAction::Updated,
                AlertTemplate::new("Course Updated", "Course {id} has new content", Cat::Course),
            )
            .alert(
                "grade",
                DataAction::Created,
                AlertTemplate::new("New Grade Posted", "A new grade is available", Cat::Grade)
                    .with_priority(NotificationPriority::High),
            )
            .presence_keys([query_key!["users", "online"], query_key!["activity"]])
    }
}

impl EventRouter {
    /// A router with no routes, alerts or presence keys.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
            alerts: HashMap::new(),
            presence: Vec::new(),
        }
    }

    /// Add key templates for `entity` (appended to any existing ones).
    pub fn route(
        mut self,
        entity: impl Into<String>,
        keys: impl IntoIterator<Item = KeyTemplate>,
    ) -> Self {
        self.routes.entry(entity.into()).or_default().extend(keys);
        self
    }

    pub fn alert(
        mut self,
        entity: impl Into<String>,
        action: DataAction,
        template: AlertTemplate,
    ) -> Self {
        self.alerts.insert((entity.into(), action), template);
        self
    }

    pub fn presence_keys(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.presence = keys.into_iter().collect();
        self
    }

    /// Keys a data update invalidates.
    pub fn keys_for(&self, update: &DataUpdate) -> Vec<QueryKey> {
        self.routes
            .get(&update.entity)
            .map(|templates| templates.iter().map(|t| t.resolve(&update.id)).collect())
            .unwrap_or_default()
    }

    pub fn route_event(
        &self,
        event: &InboundEvent,
        current_user: Option<i64>,
        cache: &CacheStore,
        sink: Option<&dyn NotificationSink>,
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        match event {
            InboundEvent::Notification(notification) => {
                outcome.notification = Some(notification.clone());
            }
            InboundEvent::DataUpdate(update) => {
                if !update.concerns(current_user) {
                    debug!(
                        entity = %update.entity,
                        id = %update.id,
                        "Update targets other users, dropped"
                    );
                    outcome.dropped = true;
                    return outcome;
                }
                outcome.invalidated = self.keys_for(update);
                if outcome.invalidated.is_empty() {
                    debug!(entity = %update.entity, "No route for entity");
                }
                outcome.notification = self
                    .alerts
                    .get(&(update.entity.clone(), update.action))
                    .map(|template| template.render(update));
            }
            InboundEvent::UserActivity(activity) => {
                debug!(user_id = ?activity.user_id, "User activity");
                outcome.invalidated = self.presence.clone();
            }
        }

        for key in &outcome.invalidated {
            cache.invalidate(key);
        }
        if let (Some(sink), Some(notification)) = (sink, &outcome.notification) {
            sink.add_notification(notification.clone());
        }
        debug!(
            kind = ?event.kind(),
            invalidated = outcome.invalidated.len(),
            notified = outcome.notification.is_some(),
            "Push event routed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::MemorySink;
    use serde_json::json;

    fn data_update(entity: &str, action: DataAction, id: KeyPart) -> InboundEvent {
        InboundEvent::DataUpdate(DataUpdate {
            entity: entity.to_string(),
            action,
            id,
            affected_users: None,
        })
    }

    #[test]
    fn test_quiz_created_invalidates_and_notifies() {
        let cache = CacheStore::new();
        cache.set(query_key!["quizzes"], json!([]));
        cache.set(query_key!["quiz", 42], json!({}));
        cache.set(query_key!["courses"], json!([]));
        let sink = MemorySink::new();

        let outcome = EventRouter::default().route_event(
            &data_update("quiz", DataAction::Created, KeyPart::Int(42)),
            Some(1),
            &cache,
            Some(&sink),
        );

        assert_eq!(outcome.invalidated, vec![query_key!["quizzes"], query_key!["quiz", 42]]);
        assert!(cache.is_stale(&query_key!["quizzes"]));
        assert!(cache.is_stale(&query_key!["quiz", 42]));
        assert!(!cache.is_stale(&query_key!["courses"]));
        let notes = sink.drain();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "New Quiz Available");
        assert_eq!(notes[0].category, NotificationCategory::Quiz);
    }

    #[test]
    fn test_action_without_alert_only_invalidates() {
        let cache = CacheStore::new();
        let sink = MemorySink::new();
        let outcome = EventRouter::default().route_event(
            &data_update("quiz", DataAction::Deleted, KeyPart::Int(3)),
            None,
            &cache,
            Some(&sink),
        );
        assert_eq!(outcome.invalidated.len(), 2);
        assert!(outcome.notification.is_none());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_alert_message_substitutes_id() {
        let outcome = EventRouter::default().route_event(
            &data_update("course", DataAction::Updated, KeyPart::from("bio-101")),
            None,
            &CacheStore::new(),
            None,
        );
        assert_eq!(outcome.notification.unwrap().message, "Course bio-101 has new content");
    }

    #[test]
    fn test_update_for_other_users_is_dropped() {
        let cache = CacheStore::new();
        cache.set(query_key!["enrollments"], json!([]));
        let sink = MemorySink::new();
        let event = InboundEvent::DataUpdate(DataUpdate {
            entity: "enrollment".into(),
            action: DataAction::Created,
            id: KeyPart::Int(5),
            affected_users: Some(vec![10, 11]),
        });

        let outcome = EventRouter::default().route_event(&event, Some(7), &cache, Some(&sink));

        assert!(outcome.dropped);
        assert!(outcome.invalidated.is_empty());
        assert!(!cache.is_stale(&query_key!["enrollments"]));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_user_activity_touches_presence_only() {
        let cache = CacheStore::new();
        cache.set(query_key!["users", "online"], json!([]));
        cache.set(query_key!["users", "all"], json!([]));
        let outcome = EventRouter::default().route_event(
            &InboundEvent::UserActivity(Default::default()),
            None,
            &cache,
            None,
        );
        assert_eq!(
            outcome.invalidated,
            vec![query_key!["users", "online"], query_key!["activity"]]
        );
        assert!(cache.is_stale(&query_key!["users", "online"]));
        assert!(!cache.is_stale(&query_key!["users", "all"]));
    }

    #[test]
    fn test_notification_forwarded_verbatim() {
        let sink = MemorySink::new();
        let notice = Notification::warning("Maintenance", "Back soon");
        let outcome = EventRouter::default().route_event(
            &InboundEvent::Notification(notice.clone()),
            None,
            &CacheStore::new(),
            Some(&sink),
        );
        assert!(outcome.invalidated.is_empty());
        assert_eq!(sink.drain(), vec![notice]);
    }

    #[test]
    fn test_unknown_entity_and_custom_route() {
        let update = DataUpdate {
            entity: "badge".into(),
            action: DataAction::Created,
            id: KeyPart::Int(1),
            affected_users: None,
        };
        assert!(EventRouter::default().keys_for(&update).is_empty());

        let router =
            EventRouter::empty().route("badge", [KeyTemplate::with_id(query_key!["badge"])]);
        assert_eq!(router.keys_for(&update), vec![query_key!["badge", 1]]);
    }
}
