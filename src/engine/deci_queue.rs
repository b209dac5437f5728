use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::engine::connector::DeciStream;
use crate::engine::link::{FrameSink, Link};
use crate::error::{AbortReason, DeciError};
use crate::wire::frame::{sequence_of, Frame};
use crate::wire::header::ProtocolId;
use crate::wire::sequence::SequenceCounter;


/// NETMP's notification that another client took over this session's device
pub const NETMP_FORCE_DISCONNECT_NOTIFICATION: i32 = 0x80;


/// The frame engine shared by everything that belongs to one NETMP session: the control link and
///  every registered sub-protocol's link.
///
/// Outgoing frames go to per-link queues. Incoming frames are dispatched by the links' reader
///  tasks: responses are routed to the caller waiting for their sequence number, notifications
///  are queued per link for polling. Sending and receiving are guarded by separate locks, and
///  waiting callers are woken only after the receive lock is released.
///
/// Any link failure aborts the whole session: all links are closed, all waiting callers are
///  woken, and the abort reason is latched and raised to every subsequent caller.
#[derive(Clone)]
pub struct DeciQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    links: Mutex<FxHashMap<ProtocolId, Link>>,
    recv: Mutex<RecvState>,
    aborted: OnceLock<AbortReason>,
    sequence: SequenceCounter,
    max_frame_len: usize,
    max_queued_notifications: usize,
}

#[derive(Default)]
struct RecvState {
    pending: FxHashMap<u16, mpsc::UnboundedSender<Frame>>,
    notifications: FxHashMap<ProtocolId, NotificationQueue>,
}

#[derive(Default)]
struct NotificationQueue {
    frames: VecDeque<Frame>,
    notify: Arc<Notify>,
}

/// The only code that could panic while holding one of these locks is map access, so a
///  poisoned lock still holds consistent data
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeciQueue {
    /// `max_queued_notifications` bounds the notifications queued per link. Beyond that, the
    ///  oldest notification is dropped.
    pub fn new(max_frame_len: usize, max_queued_notifications: usize) -> DeciQueue {
        DeciQueue {
            shared: Arc::new(QueueShared {
                links: Default::default(),
                recv: Default::default(),
                aborted: OnceLock::new(),
                sequence: SequenceCounter::new(),
                max_frame_len,
                max_queued_notifications,
            }),
        }
    }

    pub fn next_sequence(&self) -> u16 {
        self.shared.sequence.next()
    }

    pub fn add_link(&self, protocol: ProtocolId, stream: Box<dyn DeciStream>) -> anyhow::Result<()> {
        self.check_alive()?;

        lock(&self.shared.recv).notifications.entry(protocol).or_default();

        let link = Link::spawn(protocol, stream, Arc::downgrade(&self.shared), self.shared.max_frame_len);
        let previous = lock(&self.shared.links).insert(protocol, link);
        if let Some(previous) = previous {
            warn!("replacing existing link for {:?}", protocol);
            previous.close();
        }
        debug!("added link for {:?}", protocol);
        Ok(())
    }

    pub fn has_link(&self, protocol: ProtocolId) -> bool {
        lock(&self.shared.links).contains_key(&protocol)
    }

    /// Closes a link in an orderly fashion and drops its queued notifications
    pub fn remove_link(&self, protocol: ProtocolId) {
        let link = lock(&self.shared.links).remove(&protocol);
        if let Some(link) = link {
            link.close();
        }
        let removed = lock(&self.shared.recv).notifications.remove(&protocol);
        if let Some(queue) = removed {
            queue.notify.notify_waiters();
        }
    }

    /// Queues an encoded frame on the link for `protocol` and returns the sequence number embedded
    ///  in it. If there is no link for the protocol, this returns `None`. On an aborted session,
    ///  this fails with the latched reason.
    pub fn send(&self, protocol: ProtocolId, frame: Bytes) -> anyhow::Result<Option<u16>> {
        self.check_alive()?;

        let seq = match sequence_of(&frame) {
            Some(seq) => seq,
            None => return Err(DeciError::Framing(format!("cannot send a {} byte frame", frame.len())).into()),
        };

        let links = lock(&self.shared.links);
        match links.get(&protocol) {
            Some(link) if link.send(frame) => Ok(Some(seq)),
            _ => Ok(None),
        }
    }

    /// Sends a command and returns a stream of the response's fragments. The waiter is registered
    ///  before the frame is sent, so a fast response can not get lost.
    pub fn sendrecv(&self, protocol: ProtocolId, frame: Bytes) -> anyhow::Result<ResponseStream> {
        self.check_alive()?;

        let seq = match sequence_of(&frame) {
            Some(seq) => seq,
            None => return Err(DeciError::Framing(format!("cannot send a {} byte frame", frame.len())).into()),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut recv = lock(&self.shared.recv);
            if let Some(previous) = recv.pending.insert(seq, tx) {
                if !previous.is_closed() {
                    warn!("sequence number {:#06x} is already waiting for a response - replacing the old waiter", seq);
                }
            }
        }
        let response_stream = ResponseStream {
            seq,
            rx,
            shared: self.shared.clone(),
            finished: false,
        };

        match self.send(protocol, frame) {
            Ok(Some(_)) => Ok(response_stream),
            Ok(None) => Err(DeciError::NotConnected(protocol).into()),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking poll for the next notification that arrived on the link for `protocol`.
    ///  Notifications that arrived before an abort are still handed out, then the abort reason
    ///  is raised.
    pub fn pop_notification(&self, protocol: ProtocolId) -> anyhow::Result<Option<Frame>> {
        let popped = lock(&self.shared.recv).notifications.get_mut(&protocol)
            .and_then(|q| q.frames.pop_front());
        if popped.is_some() {
            return Ok(popped);
        }
        self.check_alive()?;
        Ok(None)
    }

    /// Waits for the next notification on the link for `protocol`. There is no timeout here;
    ///  callers bound the wait.
    pub async fn wait_notification(&self, protocol: ProtocolId) -> anyhow::Result<Frame> {
        let notify = match lock(&self.shared.recv).notifications.get(&protocol) {
            Some(q) => q.notify.clone(),
            None => return Err(DeciError::NotConnected(protocol).into()),
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // register interest before checking, so nothing arriving in between is missed
            notified.as_mut().enable();

            if let Some(frame) = self.pop_notification(protocol)? {
                return Ok(frame);
            }
            if !lock(&self.shared.recv).notifications.contains_key(&protocol) {
                return Err(DeciError::NotConnected(protocol).into());
            }
            notified.await;
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.aborted.get().is_none()
    }

    pub fn check_alive(&self) -> anyhow::Result<()> {
        self.shared.check_alive()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.shared.aborted.get().cloned()
    }

    pub fn abort(&self, reason: AbortReason) {
        self.shared.abort(reason);
    }

    /// Orderly shutdown of all links. Subsequent calls fail with [DeciError::ConnectionClosed].
    pub fn close(&self) {
        self.shared.abort(AbortReason::Closed);
    }

    #[cfg(test)]
    fn num_pending(&self) -> usize {
        lock(&self.shared.recv).pending.len()
    }
}

impl QueueShared {
    fn check_alive(&self) -> anyhow::Result<()> {
        match self.aborted.get() {
            None => Ok(()),
            Some(reason) => Err(reason.to_error().into()),
        }
    }

    fn abort(&self, reason: AbortReason) {
        if self.aborted.set(reason.clone()).is_err() {
            // already down, the first reason wins
            return;
        }
        match &reason {
            AbortReason::Closed => info!("session closed"),
            other => error!("session aborted: {:?}", other),
        }

        let links = std::mem::take(&mut *lock(&self.links));
        for (_, link) in links {
            link.close();
        }

        let (pending, notifies) = {
            let mut recv = lock(&self.recv);
            let pending = std::mem::take(&mut recv.pending);
            let notifies = recv.notifications.values()
                .map(|q| q.notify.clone())
                .collect::<Vec<_>>();
            (pending, notifies)
        };
        // dropping the senders wakes every caller waiting for a response
        drop(pending);
        for notify in notifies {
            notify.notify_waiters();
        }
    }

    fn dispatch_notification(&self, link: ProtocolId, frame: Frame) {
        let is_forced_disconnect = frame.protocol() == ProtocolId::NETMP && frame.msg_type() == NETMP_FORCE_DISCONNECT_NOTIFICATION;

        debug!("notification {:?} on {:?} link", frame, link);
        let notify = {
            let mut recv = lock(&self.recv);
            let queue = recv.notifications.entry(link).or_default();
            if queue.frames.len() >= self.max_queued_notifications {
                if let Some(dropped) = queue.frames.pop_front() {
                    warn!("notification queue for {:?} is full, dropping {:?}", link, dropped);
                }
            }
            queue.frames.push_back(frame);
            queue.notify.clone()
        };
        notify.notify_one();

        if is_forced_disconnect {
            self.abort(AbortReason::ForcedDisconnect);
        }
    }

    fn dispatch_response(&self, frame: Frame) {
        let seq = frame.seq();
        let is_last = frame.frag().is_last();

        let waiter = {
            let mut recv = lock(&self.recv);
            if is_last {
                recv.pending.remove(&seq)
            }
            else {
                recv.pending.get(&seq).cloned()
            }
        };

        match waiter {
            Some(tx) => {
                debug!("response {:?}", frame);
                if tx.send(frame).is_err() {
                    debug!("waiter for {:#06x} went away before its response arrived", seq);
                }
            }
            None => warn!("received response {:?} that nobody is waiting for - discarding", frame),
        }
    }
}

impl FrameSink for QueueShared {
    fn on_frame(&self, link: ProtocolId, raw: Bytes) {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.abort(AbortReason::Protocol(format!("malformed frame on {:?} link: {}", link, e)));
                return;
            }
        };

        if frame.is_notification() {
            self.dispatch_notification(link, frame);
        }
        else {
            self.dispatch_response(frame);
        }
    }

    fn on_link_failure(&self, link: ProtocolId, reason: AbortReason) {
        warn!("link for {:?} failed: {:?}", link, reason);
        self.abort(reason);
    }
}


/// The fragments of one logical response, in arrival order
pub struct ResponseStream {
    seq: u16,
    rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<QueueShared>,
    finished: bool,
}

impl ResponseStream {
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Waits for the next fragment. Returns `None` after the last fragment, i.e. one without the
    ///  'more' bit or with the 'early' bit.
    pub async fn next_fragment(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(frame) => {
                if frame.frag().is_last() {
                    self.finished = true;
                }
                Ok(Some(frame))
            }
            None => {
                self.finished = true;
                self.shared.check_alive()?;
                Err(DeciError::ConnectionClosed.into())
            }
        }
    }

    /// Waits for the first fragment, which for most commands is the whole response
    pub async fn single(mut self) -> anyhow::Result<Frame> {
        match self.next_fragment().await? {
            Some(frame) => Ok(frame),
            None => Err(DeciError::ConnectionClosed.into()),
        }
    }

    pub async fn collect(mut self) -> anyhow::Result<Vec<Frame>> {
        let mut result = Vec::new();
        while let Some(frame) = self.next_fragment().await? {
            result.push(frame);
        }
        Ok(result)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.rx.close();
        let mut recv = lock(&self.shared.recv);
        // the sequence number may have been reused for a newer request in the meantime
        if recv.pending.get(&self.seq).is_some_and(|tx| tx.is_closed()) {
            recv.pending.remove(&self.seq);
        }
    }
}
