use tracing::info;

/// One user-facing event: either a finished file or a "check the log"
/// prompt. `link` points at whichever of the two applies.
#[derive(Debug, Clone)]
pub struct Notification {
    pub app_id: String,
    pub title: String,
    pub message: String,
    pub link: String,
    pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone)]
pub struct NotificationAction {
    pub label: String,
    pub link: String,
}

/// Fire-and-forget delivery. Implementations swallow their own failures;
/// nothing here may abort a run.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards everything; selected when notifications are not requested.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}

/// Default sink: the notification lands in the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let actions: Vec<&str> = notification
            .actions
            .iter()
            .map(|a| a.label.as_str())
            .collect();
        info!(
            app = %notification.app_id,
            title = %notification.title,
            link = %notification.link,
            actions = ?actions,
            "{}",
            notification.message
        );
    }
}
