//! Pending method calls and reply correlation.
//!
//! Every call sent with a reply expected is tracked twice: the caller holds a
//! [`PendingCall`] token, and the connection keeps the other half in a
//! [`PendingTable`] keyed by the call's serial number. When a reply with a
//! matching reply serial arrives, or the call's deadline passes, the
//! connection takes the entry out of the table and completes it. A caller
//! that gives up removes its own entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use zbus::Message;

use crate::connection::Timeout;
use crate::error::{Error, Result};

/// Completion notification attached to a pending call.
pub type Notify = Box<dyn FnOnce(Result<Message>) + Send>;

/// Run with the serial of a call whose caller stopped waiting.
pub type CancelHook = Box<dyn Fn(u32) + Send + Sync>;

enum Slot {
    /// No outcome yet, with an optional notification to run on completion.
    Waiting(Option<Notify>),
    /// The outcome, until someone takes it.
    Completed(Option<Result<Message>>),
    /// The caller lost interest; any late outcome is discarded.
    Cancelled,
}

struct PendingShared {
    serial: u32,
    slot: Mutex<Slot>,
    ready: Condvar,
    table: Weak<TableShared>,
}

impl PendingShared {
    fn complete(&self, outcome: Result<Message>) {
        let mut slot = self.slot.lock();
        match &mut *slot {
            Slot::Waiting(notify) => match notify.take() {
                Some(notify) => {
                    *slot = Slot::Completed(None);
                    drop(slot);
                    notify(outcome);
                }
                None => {
                    *slot = Slot::Completed(Some(outcome));
                    self.ready.notify_all();
                }
            },
            Slot::Completed(_) | Slot::Cancelled => {
                trace!(serial = self.serial, "Dropping late completion");
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Cancelled)
    }

    /// Remove this call from its table. The slot lock must not be held.
    fn detach(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = table.entries.lock().remove(&self.serial);
        if removed.is_some() {
            if let Some(hook) = &table.on_cancel {
                hook(self.serial);
            }
        }
    }
}

/// Handle for an outstanding method call.
///
/// The outcome can be collected once: by blocking ([`PendingCall::block`]),
/// by awaiting ([`PendingCall::reply`]) or through a notification
/// ([`PendingCall::set_notify`]). Dropping the handle does not cancel the
/// call; a notification already attached still runs.
pub struct PendingCall {
    shared: Arc<PendingShared>,
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("serial", &self.shared.serial)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl PendingCall {
    /// Serial number of the call this handle waits on.
    pub fn serial(&self) -> u32 {
        self.shared.serial
    }

    /// Check if the call has completed.
    pub fn is_complete(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Completed(_))
    }

    /// Stop waiting for the reply.
    ///
    /// An attached notification is dropped without being called. Cancelling
    /// a completed call does nothing.
    pub fn cancel(&self) {
        let mut slot = self.shared.slot.lock();
        if let Slot::Waiting(notify) = &mut *slot {
            let notify = notify.take();
            *slot = Slot::Cancelled;
            drop(slot);
            drop(notify);
            self.shared.detach();
            trace!(serial = self.shared.serial, "Pending call cancelled");
        }
    }

    /// Attach the notification to run when the call completes.
    ///
    /// If the call already completed, `notify` runs immediately on the
    /// current thread. Fails if a notification is already attached, the
    /// call was cancelled, or its outcome was already taken; `notify` is
    /// dropped in that case.
    pub fn set_notify<F>(&self, notify: F) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match &mut *slot {
            Slot::Waiting(current @ None) => {
                *current = Some(Box::new(notify));
                Ok(())
            }
            Slot::Completed(outcome @ Some(_)) => {
                let outcome = outcome.take();
                drop(slot);
                if let Some(outcome) = outcome {
                    notify(outcome);
                }
                Ok(())
            }
            Slot::Waiting(Some(_)) => Err(Error::AllocationFailed(
                "Pending call already has a notification".to_string(),
            )),
            Slot::Completed(None) => Err(Error::AllocationFailed(
                "Pending call outcome was already taken".to_string(),
            )),
            Slot::Cancelled => Err(Error::AllocationFailed(
                "Pending call was cancelled".to_string(),
            )),
        }
    }

    /// Block the current thread until the call completes.
    ///
    /// Returns the raw reply, which may be an error message. If `timeout`
    /// passes first the call is cancelled and the result is
    /// [`Error::NoReply`].
    pub fn block(self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut slot = self.shared.slot.lock();
        loop {
            match &mut *slot {
                Slot::Completed(outcome) => {
                    return outcome.take().unwrap_or_else(|| {
                        Err(Error::AllocationFailed(
                            "Pending call outcome was already taken".to_string(),
                        ))
                    });
                }
                Slot::Cancelled => return Err(Error::no_reply_timeout()),
                Slot::Waiting(_) => {}
            }

            match deadline {
                Some(deadline) => {
                    let timed_out = self.shared.ready.wait_until(&mut slot, deadline).timed_out();
                    if timed_out && matches!(*slot, Slot::Waiting(_)) {
                        *slot = Slot::Cancelled;
                        drop(slot);
                        self.shared.detach();
                        return Err(Error::no_reply_timeout());
                    }
                }
                None => self.shared.ready.wait(&mut slot),
            }
        }
    }

    /// Wait for the reply asynchronously.
    ///
    /// The deadline is enforced by the connection's expiry sweep.
    pub async fn reply(self) -> Result<Message> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.set_notify(move |outcome| {
            let _ = tx.send(outcome);
        })?;
        drop(self);
        rx.await.map_err(|_| Error::no_reply_disconnected())?
    }
}

/// Completion half of a pending call, taken out of a [`PendingTable`].
///
/// Completing runs the caller's notification, so it must happen after the
/// table lock has been released.
pub struct Completion {
    shared: Arc<PendingShared>,
}

impl Completion {
    /// Serial number of the call being completed.
    pub fn serial(&self) -> u32 {
        self.shared.serial
    }

    /// Deliver the outcome to the caller.
    pub fn finish(self, outcome: Result<Message>) {
        self.shared.complete(outcome);
    }
}

struct Entry {
    shared: Arc<PendingShared>,
    timestamp: Instant,
    timeout: Option<Duration>,
}

struct TableShared {
    entries: Mutex<HashMap<u32, Entry>>,
    on_cancel: Option<CancelHook>,
}

/// Outstanding calls on one connection, keyed by call serial.
///
/// Entries leave the table when a reply arrives, when their deadline
/// passes, or when the caller cancels or stops blocking.
pub struct PendingTable {
    shared: Arc<TableShared>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty table that runs `hook` whenever a caller gives up
    /// on a call, so the connection can forget its own bookkeeping.
    pub fn with_cancel_hook<F>(hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(hook)))
    }

    fn build(on_cancel: Option<CancelHook>) -> Self {
        Self {
            shared: Arc::new(TableShared {
                entries: Mutex::new(HashMap::new()),
                on_cancel,
            }),
        }
    }

    /// Start tracking a call and return the caller's handle.
    pub fn insert(&self, serial: u32, timeout: Timeout) -> PendingCall {
        let shared = Arc::new(PendingShared {
            serial,
            slot: Mutex::new(Slot::Waiting(None)),
            ready: Condvar::new(),
            table: Arc::downgrade(&self.shared),
        });
        self.shared.entries.lock().insert(
            serial,
            Entry {
                shared: Arc::clone(&shared),
                timestamp: Instant::now(),
                timeout: timeout.resolve(),
            },
        );
        PendingCall { shared }
    }

    /// Take the entry a reply belongs to.
    pub fn take(&self, reply_serial: u32) -> Option<Completion> {
        self.shared
            .entries
            .lock()
            .remove(&reply_serial)
            .map(|entry| Completion {
                shared: entry.shared,
            })
    }

    /// Take every entry past its deadline; cancelled entries are dropped.
    ///
    /// The cancel hook runs for each expired entry.
    pub fn take_expired(&self) -> Vec<Completion> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.shared.entries.lock().retain(|_, entry| {
            if entry.shared.is_cancelled() {
                return false;
            }
            let timed_out = entry
                .timeout
                .map(|t| now.duration_since(entry.timestamp) >= t)
                .unwrap_or(false);
            if timed_out {
                expired.push(Completion {
                    shared: Arc::clone(&entry.shared),
                });
            }
            !timed_out
        });

        if let Some(hook) = &self.shared.on_cancel {
            for completion in &expired {
                hook(completion.serial());
            }
        }
        expired
    }

    /// Take every entry, e.g. when the connection closes.
    pub fn take_all(&self) -> Vec<Completion> {
        self.shared
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| Completion {
                shared: entry.shared,
            })
            .collect()
    }

    /// Check whether a call with `serial` is still tracked.
    pub fn contains(&self, serial: u32) -> bool {
        self.shared.entries.lock().contains_key(&serial)
    }

    /// Get the number of pending calls.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Check if there are no pending calls.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::message::{create_method_call, MessageExt};

    fn reply_message() -> Message {
        create_method_call(None, "/test", None, "Reply", &("ok",)).unwrap()
    }

    #[test]
    fn test_table_insert_take() {
        let table = PendingTable::new();
        let call = table.insert(100, Timeout::Default);
        assert_eq!(call.serial(), 100);
        assert_eq!(table.len(), 1);

        let completion = table.take(100).unwrap();
        assert_eq!(completion.serial(), 100);

        // Should be removed now
        assert!(table.take(100).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_multiple_serials() {
        let table = PendingTable::new();
        let first = table.insert(100, Timeout::Default);
        let second = table.insert(101, Timeout::Default);

        table.take(101).unwrap().finish(Ok(reply_message()));
        assert!(second.is_complete());
        assert!(!first.is_complete());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_expired() {
        let table = PendingTable::new();
        let _a = table.insert(100, Timeout::After(Duration::from_millis(50)));
        let _b = table.insert(101, Timeout::After(Duration::from_millis(50)));

        thread::sleep(Duration::from_millis(100));

        let expired = table.take_expired();
        assert_eq!(expired.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_expired_partial() {
        let table = PendingTable::new();
        let _short = table.insert(100, Timeout::After(Duration::from_millis(50)));
        let _forever = table.insert(101, Timeout::Infinite);
        let _long = table.insert(102, Timeout::Default);

        thread::sleep(Duration::from_millis(100));

        let expired = table.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].serial(), 100);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_cancelled_entries_are_swept() {
        let table = PendingTable::new();
        let call = table.insert(100, Timeout::Infinite);
        call.cancel();

        assert!(table.take_expired().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_hook_sees_abandoned_calls() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let table = PendingTable::with_cancel_hook(move |serial| sink.lock().push(serial));

        let cancelled = table.insert(20, Timeout::Default);
        let blocked = table.insert(21, Timeout::Default);
        let _expiring = table.insert(22, Timeout::After(Duration::from_millis(10)));
        let answered = table.insert(23, Timeout::Default);

        cancelled.cancel();
        assert!(blocked.block(Some(Duration::from_millis(10))).is_err());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(table.take_expired().len(), 1);
        table.take(23).unwrap().finish(Ok(reply_message()));
        assert!(answered.is_complete());

        assert_eq!(*seen.lock(), vec![20, 21, 22]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_block_receives_completion_from_other_thread() {
        let table = PendingTable::new();
        let call = table.insert(7, Timeout::Default);
        let completion = table.take(7).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.finish(Ok(reply_message()));
        });

        let reply = call.block(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(reply.member_str().as_deref(), Some("Reply"));
        handle.join().unwrap();
    }

    #[test]
    fn test_block_times_out_with_no_reply() {
        let table = PendingTable::new();
        let call = table.insert(8, Timeout::Infinite);

        let err = call.block(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.name(), crate::message::error_names::NO_REPLY);

        // Giving up removes the entry, so a late reply finds nothing
        assert!(table.take(8).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_set_notify_runs_on_completion() {
        let table = PendingTable::new();
        let call = table.insert(9, Timeout::Default);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        call.set_notify(move |outcome| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        table.take(9).unwrap().finish(Ok(reply_message()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(call.is_complete());
    }

    #[test]
    fn test_set_notify_after_completion_runs_immediately() {
        let table = PendingTable::new();
        let call = table.insert(10, Timeout::Default);
        table.take(10).unwrap().finish(Err(Error::no_reply_timeout()));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        call.set_notify(move |outcome| {
            assert!(outcome.is_err());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_notify_twice_fails() {
        let table = PendingTable::new();
        let call = table.insert(11, Timeout::Default);
        call.set_notify(|_| {}).unwrap();
        assert!(matches!(
            call.set_notify(|_| {}),
            Err(Error::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_cancel_drops_notification_uncalled() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table = PendingTable::new();
        let call = table.insert(12, Timeout::Default);
        let drops = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let guard = DropCounter(Arc::clone(&drops));
        let counter = Arc::clone(&calls);
        call.set_notify(move |_| {
            let _guard = guard;
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        call.cancel();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(table.take(12).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!call.is_complete());
    }

    #[tokio::test]
    async fn test_reply_future() {
        let table = PendingTable::new();
        let call = table.insert(13, Timeout::Default);
        let completion = table.take(13).unwrap();

        tokio::spawn(async move {
            completion.finish(Ok(create_method_call(None, "/test", None, "Done", &()).unwrap()));
        });

        let reply = call.reply().await.unwrap();
        assert_eq!(reply.member_str().as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn test_reply_future_fails_when_table_drops_entry() {
        let table = PendingTable::new();
        let call = table.insert(14, Timeout::Default);
        drop(table);

        let err = call.reply().await.unwrap_err();
        assert_eq!(err.name(), crate::message::error_names::DISCONNECTED);
    }
}
