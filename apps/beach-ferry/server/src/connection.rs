use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use beach_ferry_core::{CloseReason, Role};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capability to reach one live connection: queue frames for its writer task
/// and close it. The socket itself stays with the connection's own task.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    role: Role,
    outbound: mpsc::Sender<Message>,
    signal: CloseSignal,
}

/// Shared close state of one connection. The writer task watches it and
/// emits the close frame itself, so a full outbound queue cannot swallow the
/// reason.
#[derive(Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    // `Some(None)` is a bare close; `Some(Some(_))` carries a reason.
    reason: Arc<Mutex<Option<Option<CloseReason>>>>,
}

impl CloseSignal {
    /// Records the close and wakes watchers. Returns `false` if the
    /// connection was already closing.
    fn close(&self, reason: Option<CloseReason>) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> Option<CloseReason> {
        let recorded = *self.reason.lock();
        recorded.flatten()
    }

    /// The frame the writer sends once the connection is closed.
    pub fn close_message(&self) -> Message {
        match self.reason() {
            Some(reason) => Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: Cow::Borrowed(reason.reason()),
            })),
            None => Message::Close(None),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

impl SendError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SendError::Full => "queue_full",
            SendError::Closed => "closed",
        }
    }
}

impl ConnectionHandle {
    pub fn new(role: Role, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            outbound,
            signal: CloseSignal::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queues a frame without waiting. Used on the direct relay path so a
    /// slow receiver never stalls the sender's loop.
    pub fn try_send(&self, message: Message) -> Result<(), SendError> {
        if self.signal.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queues a frame, waiting for room.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        if self.signal.is_closed() {
            return Err(SendError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Closes the connection with a reason the peer can see. Only the first
    /// close takes effect.
    pub fn close(&self, reason: CloseReason) {
        self.signal.close(Some(reason));
    }

    /// Closes the connection with a bare close frame: no code, no reason.
    pub fn close_silently(&self) {
        self.signal.close(None);
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Why the relay closed this connection, if it gave a reason.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.signal.reason()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.signal.clone()
    }

    /// Resolves once the relay has closed this connection.
    pub async fn closed(&self) {
        self.signal.cancelled().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}
