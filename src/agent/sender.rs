use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::errors::{MonkeyError, MonkeyResult};
use crate::protocol::{encode, Packet};

/// Requests handled by the agent thread, the only writer on the link.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Send(Vec<u8>),
    Flush,
    Shutdown,
}

/// First write failure on the link, shared between the writer and senders.
#[derive(Debug, Clone, Default)]
pub(crate) struct WriteErrorSlot(Arc<Mutex<Option<String>>>);

impl WriteErrorSlot {
    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn record(&self, error: &MonkeyError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }
}

/// Queues packets for the agent thread. Usable from any thread; never blocks
/// on I/O. Packets from one sender go out in the order they were queued.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::UnboundedSender<LinkCommand>,
    write_error: WriteErrorSlot,
}

impl PacketSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LinkCommand>) -> Self {
        Self {
            tx,
            write_error: WriteErrorSlot::default(),
        }
    }

    pub(crate) fn error_slot(&self) -> WriteErrorSlot {
        self.write_error.clone()
    }

    pub fn send(&self, packet: &Packet) -> MonkeyResult<()> {
        if let Some(err) = self.last_write_error() {
            return Err(MonkeyError::Transport(format!(
                "cannot send data to controller: {err}"
            )));
        }
        let bytes = encode(packet)?;
        tracing::trace!(kind = %packet.kind(), bytes = bytes.len(), "packet queued");
        self.command(LinkCommand::Send(bytes))
    }

    pub fn send_user_event(&self, statement: impl Into<String>) -> MonkeyResult<()> {
        self.send(&Packet::UserEvent(statement.into()))
    }

    pub fn send_log(&self, line: impl Into<String>) -> MonkeyResult<()> {
        self.send(&Packet::ScriptLog(line.into()))
    }

    pub(crate) fn command(&self, command: LinkCommand) -> MonkeyResult<()> {
        self.tx.send(command).map_err(|_| MonkeyError::ShutDown)
    }

    /// First write failure seen by the agent thread, if any.
    pub fn last_write_error(&self) -> Option<String> {
        self.write_error.get()
    }
}
