//! Feature-local mirrors of backend-reported state.
//!
//! Every feature owns its own mirror and refresh poll; nothing here is shared
//! between features.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use shared::{
    error::ChannelError,
    protocol::{Command, InboundFrame},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::CommandChannel;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct FeatureFlag {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub running: bool,
}

pub trait StatusMirror: Clone + Send + Sync + 'static {
    /// Frame discriminators this mirror listens to.
    fn titles(&self) -> Vec<&'static str>;

    /// Applies `frame`, returning whether the mirror changed.
    fn apply(&mut self, frame: &InboundFrame) -> bool;
}

/// On/off feature driven by an activation reply and an optional status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleMirror {
    activation_title: &'static str,
    status_title: Option<&'static str>,
    flag: FeatureFlag,
}

impl ToggleMirror {
    pub fn new(activation_title: &'static str, status_title: Option<&'static str>) -> Self {
        Self {
            activation_title,
            status_title,
            flag: FeatureFlag::default(),
        }
    }

    pub fn bollios() -> Self {
        Self::new("bolliOs", Some("bolliOsStatus"))
    }

    pub fn motion_tracking() -> Self {
        Self::new("motionTracking", None)
    }

    pub fn flag(&self) -> FeatureFlag {
        self.flag
    }
}

impl StatusMirror for ToggleMirror {
    fn titles(&self) -> Vec<&'static str> {
        std::iter::once(self.activation_title)
            .chain(self.status_title)
            .collect()
    }

    fn apply(&mut self, frame: &InboundFrame) -> bool {
        let before = self.flag;
        let Some(key) = frame.discriminator() else {
            return false;
        };

        if key == self.activation_title {
            // Anything other than "activated" reads as off.
            if let Some(data) = frame.data_str() {
                self.flag.active = data == "activated";
            }
        } else if Some(key) == self.status_title {
            if frame.data.is_object() {
                if let Ok(flag) = serde_json::from_value::<FeatureFlag>(frame.data.clone()) {
                    self.flag = flag;
                }
            } else if let Some(active) = frame.data.as_bool() {
                self.flag.active = active;
            }
        }

        self.flag != before
    }
}

/// Active computer-vision mode; `None` when no mode runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CvModeMirror {
    mode: Option<String>,
}

impl CvModeMirror {
    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}

impl StatusMirror for CvModeMirror {
    fn titles(&self) -> Vec<&'static str> {
        vec!["cvMode"]
    }

    fn apply(&mut self, frame: &InboundFrame) -> bool {
        if frame.discriminator() != Some("cvMode") {
            return false;
        }
        let Some(mode) = frame.data_str() else {
            return false;
        };
        let next = match mode.trim() {
            "" | "none" => None,
            mode => Some(mode.to_string()),
        };
        if next == self.mode {
            return false;
        }
        self.mode = next;
        true
    }
}

pub struct MirrorHandle<M> {
    rx: watch::Receiver<M>,
}

impl<M: Clone> MirrorHandle<M> {
    pub fn current(&self) -> M {
        self.rx.borrow().clone()
    }

    /// Waits for the next change; `None` once the channel is gone.
    pub async fn changed(&mut self) -> Option<M> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<M> {
        self.rx.clone()
    }
}

/// Registers `mirror` on `channel` and returns a handle to observe it.
pub async fn attach<M: StatusMirror>(channel: &CommandChannel, mirror: M) -> MirrorHandle<M> {
    let titles = mirror.titles();
    let (tx, rx) = watch::channel(mirror);
    let tx = Arc::new(tx);
    for title in titles {
        let tx = Arc::clone(&tx);
        channel
            .register_handler(title, move |frame| {
                tx.send_if_modified(|mirror| mirror.apply(frame));
            })
            .await;
    }
    MirrorHandle { rx }
}

/// Sends `command` every `every` until the channel shuts down.
pub fn spawn_status_poll(
    channel: Arc<CommandChannel>,
    command: Command,
    every: Duration,
) -> JoinHandle<()> {
    let every = every.max(MIN_POLL_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match channel.send(command.clone()).await {
                Ok(()) => {}
                Err(ChannelError::Shutdown) => break,
                Err(err) => debug!(command = command.name(), "status poll: {err}"),
            }
        }
    })
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
