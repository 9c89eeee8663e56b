//! Thread host for [`SessionCore`]
//!
//! Audio streams are pinned to the thread that opened them, so the core
//! lives on one dedicated thread driving a current-thread runtime. Callers
//! talk to it through a command channel and observe it through a watch
//! channel of [`SessionSnapshot`]s.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::core::SessionCore;
use super::{SessionSnapshot, Voice};
use crate::audio::AudioHost;
use crate::settings::LiveSettings;
use crate::transport::Transport;

const THREAD_NAME: &str = "vokey-live-session";

#[derive(Debug)]
enum Command {
    Connect(Voice),
    Disconnect,
    Shutdown,
}

/// Handle to a running session thread
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    thread: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the session thread
    ///
    /// Fails only if the runtime or the thread cannot be created.
    pub fn start(
        host: Arc<dyn AudioHost>,
        transport: Arc<dyn Transport>,
        settings: LiveSettings,
    ) -> std::io::Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(SessionSnapshot::default());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let core = SessionCore::with_publisher(host, transport, settings, snapshot_tx);
                    run_loop(core, command_rx).await;
                });
            })?;

        Ok(Self {
            commands,
            snapshots,
            thread: Some(thread),
        })
    }

    /// Request a session with `voice`; ignored if one is already live
    pub fn connect(&self, voice: Voice) {
        self.send(Command::Connect(voice));
    }

    /// End the current session, if any. Idempotent.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every status, error or volume change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Disconnect and stop the session thread
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.send(Command::Shutdown);
        if thread.join().is_err() {
            log::error!("Session thread panicked");
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            log::warn!("Session thread is gone, dropping {:?}", e.0);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_loop(mut core: SessionCore, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut meter = tokio::time::interval(core.settings().meter_interval());
    meter.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!("Session thread started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect(voice)) => core.connect(voice),
                Some(Command::Disconnect) => core.disconnect(),
                Some(Command::Shutdown) | None => break,
            },
            Some(event) = core.next_event() => core.handle(event),
            _ = meter.tick(), if core.wants_meter_ticks() => core.tick(),
        }
    }

    core.disconnect();
    log::info!("Session thread stopped");
}
