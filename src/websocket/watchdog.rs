use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::websocket::session::Command;

pub(crate) struct Watchdog {
    deadline: Duration,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn arm(
        id: Uuid,
        deadline: Duration,
        connected: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let task = tokio::spawn(async move {
            sleep(deadline).await;
            if connected.load(Ordering::SeqCst) {
                return;
            }
            warn!("Session {} did not connect within {:?}, aborting", id, deadline);
            let _ = commands.send(Command::WatchdogExpired(deadline));
        });

        Self {
            deadline,
            task: Some(task),
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Watchdog ({:?}) disarmed", self.deadline);
            task.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}
