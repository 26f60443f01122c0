use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{ChunkedResponse, ResponseAccumulator, ResponseShape, decode_text};
use crate::error::{AdapterError, ElmError, ErrorClass};
use crate::store::LastError;

type Reply<T> = oneshot::Sender<Result<T, ElmError>>;

/// Completion handle for one command, typed by the requested projection.
#[derive(Debug)]
pub(crate) enum Responder {
    Text(Reply<String>),
    Bytes(Reply<Vec<u8>>),
    Chunked(Reply<ChunkedResponse>),
}

impl Responder {
    pub(crate) fn shape(&self) -> ResponseShape {
        match self {
            Self::Text(_) => ResponseShape::Text,
            Self::Bytes(_) => ResponseShape::Bytes,
            Self::Chunked(_) => ResponseShape::ChunkedBytes,
        }
    }

    /// Projects a completed response onto the requested shape.
    fn complete(self, command: &str, response: ChunkedResponse) -> Delivery {
        match self {
            Self::Text(reply) => {
                let (data, _) = response.into_parts();
                let text = decode_text(data).map_err(|source| ElmError::ResponseDecode {
                    command: command.to_string(),
                    source,
                });
                Delivery::Text(reply, text)
            }
            Self::Bytes(reply) => {
                let (data, _) = response.into_parts();
                Delivery::Bytes(reply, Ok(data))
            }
            Self::Chunked(reply) => Delivery::Chunked(reply, Ok(response)),
        }
    }

    fn fail(self, error: ElmError) -> Delivery {
        match self {
            Self::Text(reply) => Delivery::Text(reply, Err(error)),
            Self::Bytes(reply) => Delivery::Bytes(reply, Err(error)),
            Self::Chunked(reply) => Delivery::Chunked(reply, Err(error)),
        }
    }

    /// Rejects a command that never reached the pending slot.
    pub(crate) fn reject(self, error: ElmError) {
        self.fail(error).send();
    }
}

/// A result paired with the handle it is owed to.
#[derive(Debug)]
enum Delivery {
    Text(Reply<String>, Result<String, ElmError>),
    Bytes(Reply<Vec<u8>>, Result<Vec<u8>, ElmError>),
    Chunked(Reply<ChunkedResponse>, Result<ChunkedResponse, ElmError>),
}

impl Delivery {
    fn error(&self) -> Option<&ElmError> {
        match self {
            Self::Text(_, result) => result.as_ref().err(),
            Self::Bytes(_, result) => result.as_ref().err(),
            Self::Chunked(_, result) => result.as_ref().err(),
        }
    }

    fn send(self) {
        let delivered = match self {
            Self::Text(reply, result) => reply.send(result).is_ok(),
            Self::Bytes(reply, result) => reply.send(result).is_ok(),
            Self::Chunked(reply, result) => reply.send(result).is_ok(),
        };
        if !delivered {
            trace!("command caller dropped its response future");
        }
    }
}

/// A command that has left the pending slot and whose caller has not been
/// told yet.
#[derive(Debug)]
#[must_use = "the caller is only woken by `deliver`"]
pub(crate) struct Settlement {
    command: String,
    delivery: Delivery,
}

impl Settlement {
    pub(crate) fn command(&self) -> &str {
        &self.command
    }

    /// The error to record, if the command failed.
    pub(crate) fn error(&self) -> Option<LastError> {
        self.delivery
            .error()
            .map(|error| LastError::new(ErrorClass::Command, error))
    }

    pub(crate) fn deliver(self) {
        self.delivery.send();
    }
}

/// The single in-flight command.
#[derive(Debug)]
struct PendingCommand {
    command: String,
    accumulator: ResponseAccumulator,
    deadline: Instant,
    timeout: Duration,
    responder: Responder,
}

impl PendingCommand {
    fn fail(self, error: ElmError) -> Settlement {
        Settlement {
            command: self.command,
            delivery: self.responder.fail(error),
        }
    }
}

/// Owns the pending command slot. A command is pending exactly when the slot
/// holds a value; taking the value out disarms its deadline.
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    pending: Option<PendingCommand>,
}

impl Correlator {
    #[cfg(test)]
    pub(crate) fn pending_command(&self) -> Option<&str> {
        self.pending.as_ref().map(|pending| pending.command.as_str())
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    /// Installs a new command, or hands the responder back with
    /// `CommandInProgress` when the slot is taken. The existing command is
    /// left untouched either way.
    pub(crate) fn install(
        &mut self,
        command: String,
        timeout: Duration,
        now: Instant,
        responder: Responder,
    ) -> Result<(), (Responder, ElmError)> {
        if let Some(pending) = &self.pending {
            let error = ElmError::CommandInProgress {
                requested: command,
                pending: pending.command.clone(),
            };
            return Err((responder, error));
        }

        debug!(%command, shape = %responder.shape(), ?timeout, "command installed");
        self.pending = Some(PendingCommand {
            command,
            accumulator: ResponseAccumulator::default(),
            deadline: now + timeout,
            timeout,
            responder,
        });
        Ok(())
    }

    /// Feeds one notification fragment to the pending command.
    pub(crate) fn ingest(&mut self, chunk: &[u8]) -> Option<Settlement> {
        let Some(pending) = self.pending.as_mut() else {
            debug!(len = chunk.len(), "dropping notification outside a command window");
            return None;
        };

        trace!(command = %pending.command, chunk = %hex::encode(chunk), "ingesting fragment");
        let response = pending.accumulator.push(chunk)?;
        let PendingCommand {
            command, responder, ..
        } = self.pending.take()?;

        let delivery = responder.complete(&command, response);
        if let Some(error) = delivery.error() {
            warn!(%command, %error, "response could not be projected");
        }
        Some(Settlement { command, delivery })
    }

    /// Fails the pending command with a timeout once its deadline passed.
    pub(crate) fn expire(&mut self, now: Instant) -> Option<Settlement> {
        if self.pending.as_ref()?.deadline > now {
            return None;
        }

        let pending = self.pending.take()?;
        warn!(command = %pending.command, buffered = pending.accumulator.buffered_len(), "command timed out");
        let error = ElmError::CommandTimeout {
            command: pending.command.clone(),
            timeout: pending.timeout,
        };
        Some(pending.fail(error))
    }

    /// Fails the pending command because the connection went away.
    pub(crate) fn cancel(&mut self) -> Option<Settlement> {
        let pending = self.pending.take()?;
        debug!(command = %pending.command, "cancelling command on disconnect");
        let error = ElmError::DisconnectedDuringCommand {
            command: pending.command.clone(),
        };
        Some(pending.fail(error))
    }

    /// Fails the pending command because its bytes could not be written.
    pub(crate) fn fail_write(&mut self, source: AdapterError) -> Option<Settlement> {
        let pending = self.pending.take()?;
        let error = ElmError::Write {
            command: pending.command.clone(),
            source,
        };
        Some(pending.fail(error))
    }
}
