// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The unit of delivery: a single message received on a subscribed connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::conn::ConnId;
use crate::reader::ConnCommand;
use crate::{debug, warn};

/// 16-byte ASCII message id, as assigned by `nsqd`.
pub type MessageId = [u8; 16];

/// A disposition the handler (or the library, on its behalf) assigns to a message.
///
/// `Defer` corresponds to async-handler mode: the handler stashed the message
/// and will call [`Message::finish`], [`Message::requeue`], or
/// [`Message::touch`] later, possibly from another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Send `FIN` — the message was processed successfully.
    Finish,
    /// Send `REQ` with the given delay; `backoff` feeds the backoff controller.
    Requeue { delay: Duration, backoff: bool },
    /// The handler will decide later (async mode).
    Defer,
}

/// State shared between a [`Message`] and the connection that owns its
/// response channel. `Message` never holds a strong reference to the
/// connection or the `Reader` — only a connection id plus a clone of the
/// control-loop's command sender, so a `Message` outliving its connection
/// just finds the command silently dropped instead of leaking anything.
struct Inner {
    id: MessageId,
    body: Vec<u8>,
    timestamp: i64,
    attempts: u16,
    conn_id: ConnId,
    commands: crossbeam_channel::Sender<ConnCommand>,
    has_responded: AtomicBool,
    is_async: AtomicBool,
}

/// A single NSQ message.
///
/// Cloning a `Message` is cheap (it's an `Arc`) and all clones share the same
/// `has_responded` flag, so at most one of [`finish`](Message::finish),
/// [`requeue`](Message::requeue), or connection loss ever produces a wire
/// response for a given message — a duplicate call is a handler bug and is
/// defensively ignored with a warning rather than sending a second FIN/REQ.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    pub(crate) fn new(
        id: MessageId,
        body: Vec<u8>,
        timestamp: i64,
        attempts: u16,
        conn_id: ConnId,
        commands: crossbeam_channel::Sender<ConnCommand>,
    ) -> Self {
        Message(Arc::new(Inner {
            id,
            body,
            timestamp,
            attempts,
            conn_id,
            commands,
            has_responded: AtomicBool::new(false),
            is_async: AtomicBool::new(false),
        }))
    }

    /// The 16-byte message id assigned by the broker.
    pub fn id(&self) -> &MessageId {
        &self.0.id
    }

    /// The message id rendered as a UTF-8 string (NSQ ids are always ASCII).
    pub fn id_str(&self) -> &str {
        std::str::from_utf8(&self.0.id).unwrap_or("<invalid-id>")
    }

    /// Opaque message body.
    pub fn body(&self) -> &[u8] {
        &self.0.body
    }

    /// Nanoseconds since epoch, as reported by the broker.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp
    }

    /// Number of times this message has previously been delivered (1 on first delivery).
    pub fn attempts(&self) -> u16 {
        self.0.attempts
    }

    /// The connection this message arrived on.
    pub(crate) fn conn_id(&self) -> ConnId {
        self.0.conn_id
    }

    /// True once a terminal response (FIN/REQ) has been sent for this message.
    pub fn has_responded(&self) -> bool {
        self.0.has_responded.load(Ordering::SeqCst)
    }

    /// Mark this message for asynchronous (deferred) disposition.
    ///
    /// After calling this, the Reader will not auto-FIN/REQ based on the
    /// handler's return value; the handler (or any thread holding a clone of
    /// this `Message`) must eventually call [`finish`](Message::finish),
    /// [`requeue`](Message::requeue), or rely on the broker's own visibility
    /// timeout.
    pub fn enable_async(&self) {
        self.0.is_async.store(true, Ordering::SeqCst);
    }

    /// Whether [`enable_async`](Message::enable_async) was called.
    pub fn is_async(&self) -> bool {
        self.0.is_async.load(Ordering::SeqCst)
    }

    /// Idempotently finish (`FIN`) this message.
    ///
    /// A second call (from any thread) is a no-op save for a warning log —
    /// exactly one FIN/REQ is ever produced per message.
    pub fn finish(&self) {
        self.respond_once(Disposition::Finish);
    }

    /// Idempotently requeue (`REQ`) this message after `delay`.
    ///
    /// `backoff = true` signals a handler failure to the backoff controller;
    /// `backoff = false` is a deliberate requeue (e.g. rate limiting) that
    /// does not count against the connection.
    pub fn requeue(&self, delay: Duration, backoff: bool) {
        self.respond_once(Disposition::Requeue { delay, backoff });
    }

    /// Extend the broker's visibility timeout for this message. May be
    /// called repeatedly (it is not a terminal response).
    pub fn touch(&self) {
        if self.has_responded() {
            warn!("touch() called on already-responded message {}", self.id_str());
            return;
        }
        let _ = self.0.commands.send(ConnCommand::Touch(self.0.conn_id, *self.id()));
    }

    /// Finish this message without going through the handler or counting
    /// toward backoff -- used only for the `attempts > max_tries` give-up
    /// path, where the Reader never calls the handler at all.
    pub(crate) fn force_finish(&self) {
        if self
            .0
            .has_responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("force_finish on already-responded message {}", self.id_str());
            return;
        }
        let _ = self.0.commands.send(ConnCommand::ForceFinish(self.0.conn_id, *self.id()));
    }

    fn respond_once(&self, disposition: Disposition) {
        if self
            .0
            .has_responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                "duplicate response ({:?}) ignored for message {} -- handler bug",
                disposition,
                self.id_str()
            );
            return;
        }
        debug!("message {} disposed: {:?}", self.id_str(), disposition);
        let _ = self
            .0
            .commands
            .send(ConnCommand::Respond(self.0.conn_id, *self.id(), disposition));
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id_str())
            .field("attempts", &self.attempts())
            .field("body_len", &self.body().len())
            .field("has_responded", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message() -> (Message, crossbeam_channel::Receiver<ConnCommand>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let msg = Message::new(*b"0123456789abcdef", b"hello".to_vec(), 1_700_000_000_000_000_000, 1, ConnId(0), tx);
        (msg, rx)
    }

    #[test]
    fn finish_sends_exactly_one_command() {
        let (msg, rx) = make_message();
        msg.finish();
        msg.finish(); // duplicate, ignored
        msg.finish();
        assert_eq!(rx.len(), 1);
        assert!(msg.has_responded());
    }

    #[test]
    fn requeue_after_finish_is_ignored() {
        let (msg, rx) = make_message();
        msg.finish();
        msg.requeue(Duration::from_secs(1), true);
        assert_eq!(rx.len(), 1);
        match rx.recv().unwrap() {
            ConnCommand::Respond(_, _, Disposition::Finish) => {}
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn clone_shares_responded_state() {
        let (msg, rx) = make_message();
        let clone = msg.clone();
        msg.finish();
        clone.finish();
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn id_str_round_trips() {
        let (msg, _rx) = make_message();
        assert_eq!(msg.id_str(), "0123456789abcdef");
    }

    #[test]
    fn force_finish_bypasses_disposition_but_still_latches() {
        let (msg, rx) = make_message();
        msg.force_finish();
        msg.finish(); // ignored, already responded
        assert_eq!(rx.len(), 1);
        match rx.recv().unwrap() {
            ConnCommand::ForceFinish(_, id) => assert_eq!(id, *msg.id()),
            other => panic!("expected ForceFinish, got {other:?}"),
        }
    }
}
