// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The application-supplied message handler.

use std::error::Error as StdError;

use crate::message::Message;

/// Boxed error type handlers return; any `std::error::Error` works via `?`.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// What a [`Handler`] invocation produced.
pub type HandlerResult = Result<(), HandlerError>;

/// Processes one [`Message`] at a time.
///
/// Returning `Ok(())` auto-`FIN`s the message; returning `Err` auto-`REQ`s it
/// with backoff (unless the message called
/// [`Message::enable_async`](crate::message::Message::enable_async), in which
/// case the return value is ignored and the message is left alone until
/// something calls `finish`/`requeue`/`touch` on it directly, possibly from
/// another thread).
///
/// Implemented for any `Fn(&Message) -> HandlerResult` closure, so the common
/// case doesn't need a dedicated type.
pub trait Handler: Send + Sync {
    fn handle(&self, msg: &Message) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync,
{
    fn handle(&self, msg: &Message) -> HandlerResult {
        self(msg)
    }
}
