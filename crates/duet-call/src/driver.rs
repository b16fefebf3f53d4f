//! Runs a [`CallSession`] on its own task.
//!
//! User commands and session events are handled one at a time on that task,
//! so no two handlers ever observe the session half-updated. Callers talk
//! to it through a cloneable [`CallHandle`].

use duet_proto::MediaState;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::CallError;
use crate::session::{CallNotice, CallSession, CallSnapshot, SessionEvent};
use crate::state::ConnectionState;

const COMMAND_BUFFER: usize = 32;

enum CallCommand {
    Start {
        requested: Option<String>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Join {
        session_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<MediaState>,
    },
    ToggleVideo {
        reply: oneshot::Sender<MediaState>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

enum Step {
    Command(Option<CallCommand>),
    Event(Option<SessionEvent>),
}

#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<CallNotice>,
}

/// The driver task. Dropping every [`CallHandle`] ends the call and stops
/// the task.
pub struct CallTask {
    task: JoinHandle<()>,
}

impl CallTask {
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub fn spawn_call(mut session: CallSession) -> (CallHandle, CallTask) {
    let (commands, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = CallHandle {
        commands,
        state: session.subscribe_state(),
        notices: session.notice_sender(),
    };

    let task = tokio::spawn(async move {
        loop {
            let step = tokio::select! {
                command = rx.recv() => Step::Command(command),
                event = session.next_event() => Step::Event(event),
            };
            match step {
                Step::Command(Some(command)) => execute(&mut session, command).await,
                Step::Command(None) => {
                    session.end_call().await;
                    break;
                }
                Step::Event(Some(event)) => session.handle_event(event).await,
                Step::Event(None) => break,
            }
        }
        debug!("call driver stopped");
    });

    (handle, CallTask { task })
}

async fn execute(session: &mut CallSession, command: CallCommand) {
    match command {
        CallCommand::Start { requested, reply } => {
            let result = session.start_call(requested.as_deref()).await;
            let _ = reply.send(result);
        }
        CallCommand::Join { session_id, reply } => {
            let result = session.join_call(&session_id).await;
            let _ = reply.send(result);
        }
        CallCommand::End { reply } => {
            session.end_call().await;
            let _ = reply.send(());
        }
        CallCommand::ToggleMute { reply } => {
            let _ = reply.send(session.toggle_mute());
        }
        CallCommand::ToggleVideo { reply } => {
            let _ = reply.send(session.toggle_video());
        }
        CallCommand::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
    }
}

impl CallHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Starts a call. `None` or a blank name reuses the remembered room or
    /// generates one.
    pub async fn start(&self, requested: Option<&str>) -> Result<(), CallError> {
        let requested = requested.map(str::to_string);
        self.request(|reply| CallCommand::Start { requested, reply })
            .await?
    }

    pub async fn join(&self, session_id: &str) -> Result<(), CallError> {
        let session_id = session_id.to_string();
        self.request(|reply| CallCommand::Join { session_id, reply })
            .await?
    }

    pub async fn end(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::End { reply }).await
    }

    pub async fn toggle_mute(&self) -> Result<MediaState, CallError> {
        self.request(|reply| CallCommand::ToggleMute { reply }).await
    }

    pub async fn toggle_video(&self) -> Result<MediaState, CallError> {
        self.request(|reply| CallCommand::ToggleVideo { reply }).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| CallCommand::Snapshot { reply }).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), CallError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| CallError::SessionClosed)
    }
}
