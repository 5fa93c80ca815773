use tokio::sync::{broadcast, mpsc};
use upsync_contract::{Notification, UploadEvent};

/// Outbound channel towards the notification subsystem and UI listeners.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: UploadEvent);

    fn notify(&self, notification: Notification) {
        self.publish(UploadEvent::Notification(notification));
    }
}

impl EventSink for broadcast::Sender<UploadEvent> {
    fn publish(&self, event: UploadEvent) {
        // no subscribers is fine
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<UploadEvent> {
    fn publish(&self, event: UploadEvent) {
        let _ = self.send(event);
    }
}
