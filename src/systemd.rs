//! sd_notify integration for running `imgsync watch` as a systemd service.
//!
//! Every method is a no-op when disabled or off Linux.

use crate::lifecycle::LibraryStats;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SystemdNotifier {
    enabled: bool,
}

impl SystemdNotifier {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `READY=1`, sent once the first reconciliation pass has settled.
    pub(crate) fn notify_ready(&self) {
        self.send(Message::Ready);
    }

    pub(crate) fn notify_stopping(&self) {
        self.send(Message::Stopping);
    }

    /// `STATUS=` line built from the library stats.
    pub(crate) fn notify_stats(&self, stats: &LibraryStats) {
        self.send(Message::Status(&stats.status_line()));
    }

    fn send(&self, message: Message<'_>) {
        if !self.enabled {
            return;
        }
        send_impl(message);
    }
}

#[derive(Debug, Clone, Copy)]
enum Message<'a> {
    Ready,
    Stopping,
    Status(&'a str),
}

#[cfg(target_os = "linux")]
fn send_impl(message: Message<'_>) {
    use sd_notify::NotifyState;

    let state = match message {
        Message::Ready => NotifyState::Ready,
        Message::Stopping => NotifyState::Stopping,
        Message::Status(line) => NotifyState::Status(line),
    };
    if let Err(e) = sd_notify::notify(false, &[state]) {
        tracing::debug!(error = %e, ?message, "sd_notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn send_impl(_message: Message<'_>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LibraryStatus;

    fn stats() -> LibraryStats {
        LibraryStats {
            status: LibraryStatus::Watching,
            directory: None,
            total_images: 3,
            last_update: None,
            last_error: None,
        }
    }

    #[test]
    fn disabled_notifier_is_noop() {
        let n = SystemdNotifier::new(false);
        n.notify_ready();
        n.notify_stats(&stats());
        n.notify_stopping();
    }

    #[test]
    fn enabled_notifier_without_socket_does_not_panic() {
        let n = SystemdNotifier::new(true);
        n.notify_ready();
        n.notify_stats(&stats());
        n.notify_stopping();
    }
}
