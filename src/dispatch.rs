//! Command dispatch core.
//!
//! The [`DispatchTable`] maps command ids to a deserializer plus an ordered
//! list of subscribers. Registration, removal, and lookup run under one
//! short lock; the dispatch path copies the subscriber snapshot under that
//! lock and invokes handlers outside it, each on the worker pool, so a slow
//! or panicking handler never stalls registration or poisons its neighbors.
//!
//! Ordering: subscribers for a given (peer, command) run in registration
//! order; the per-connection dispatch task awaits each fan-out, so frames of
//! one peer deliver FIFO. Nothing is ordered across peers.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::codec::WireMessage;
use crate::error::{NetError, Result, SendError};
use crate::peer::PeerKey;
use crate::protocol::wire::is_reserved_command;

/// Boxed future used by erased handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The sending half a handler replies through. Connections implement this;
/// tests substitute recorders.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame to the remote end of this sink.
    async fn send_frame(
        &self,
        command: u16,
        payload: &[u8],
        response_id: u32,
    ) -> std::result::Result<(), SendError>;
}

/// What a subscriber receives for one inbound frame.
pub struct Delivery<M> {
    /// Originating peer, when the frame arrived server-side.
    pub peer: Option<PeerKey>,
    /// Correlation id carried by the frame; 0 means fire-and-forget.
    pub response_id: u32,
    /// The deserialized message, shared across subscribers.
    pub message: Arc<M>,
    sink: Arc<dyn FrameSink>,
}

impl<M> Delivery<M> {
    /// Reply to the sender, preserving this frame's response id.
    pub async fn reply<R: WireMessage>(&self, command: u16, message: &R) -> Result<()> {
        let payload = message.encode()?;
        self.sink
            .send_frame(command, &payload, self.response_id)
            .await
            .map_err(NetError::Send)
    }

    /// Reply with raw payload bytes, preserving this frame's response id.
    pub async fn reply_raw(
        &self,
        command: u16,
        payload: &[u8],
    ) -> std::result::Result<(), SendError> {
        self.sink
            .send_frame(command, payload, self.response_id)
            .await
    }

    /// Send an unrelated frame back over the same connection.
    pub async fn send_raw(
        &self,
        command: u16,
        payload: &[u8],
    ) -> std::result::Result<(), SendError> {
        self.sink.send_frame(command, payload, 0).await
    }
}

impl<M> Clone for Delivery<M> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer,
            response_id: self.response_id,
            message: Arc::clone(&self.message),
            sink: Arc::clone(&self.sink),
        }
    }
}

/// Identity token returned by subscriber registration; removal is by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type ErasedMsg = Arc<dyn Any + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Option<ErasedMsg> + Send + Sync>;
type HandlerFn = Arc<dyn Fn(RawDelivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased delivery handed to erased handlers.
#[derive(Clone)]
struct RawDelivery {
    peer: Option<PeerKey>,
    response_id: u32,
    message: ErasedMsg,
    sink: Arc<dyn FrameSink>,
}

struct CommandEntry {
    decode: DecodeFn,
    subscribers: Vec<(SubscriberId, HandlerFn)>,
}

/// Command id → {deserializer, subscriber list}.
pub struct DispatchTable {
    entries: Mutex<HashMap<u16, CommandEntry>>,
    next_subscriber: AtomicU64,
}

impl DispatchTable {
    /// Create a table with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Register a command with `M`'s decoder and an empty subscriber list.
    ///
    /// Idempotent on repeat: the existing entry is kept. Registering inside
    /// the reserved system range is an error.
    pub fn add_command<M: WireMessage>(&self, command: u16) -> Result<()> {
        if is_reserved_command(command) {
            return Err(NetError::ReservedCommand(command));
        }
        let mut entries = self.entries.lock();
        entries.entry(command).or_insert_with(|| CommandEntry {
            decode: Arc::new(|bytes| match M::decode(bytes) {
                Ok(m) => Some(Arc::new(m) as ErasedMsg),
                Err(e) => {
                    warn!(error = %e, "payload decode failed");
                    None
                }
            }),
            subscribers: Vec::new(),
        });
        Ok(())
    }

    /// Remove a command entry and release its subscribers.
    pub fn remove_command(&self, command: u16) -> bool {
        self.entries.lock().remove(&command).is_some()
    }

    /// Whether a command is registered.
    pub fn has_command(&self, command: u16) -> bool {
        self.entries.lock().contains_key(&command)
    }

    /// Append a subscriber to a registered command.
    ///
    /// Returns the identity token used for removal. Fails when the command
    /// was never added.
    pub fn add_subscriber<M, F, Fut>(&self, command: u16, handler: F) -> Result<SubscriberId>
    where
        M: WireMessage,
        F: Fn(Delivery<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |raw: RawDelivery| -> BoxFuture<'static, ()> {
            let handler = Arc::clone(&handler);
            match raw.message.clone().downcast::<M>() {
                Ok(message) => Box::pin(handler(Delivery {
                    peer: raw.peer,
                    response_id: raw.response_id,
                    message,
                    sink: raw.sink,
                })),
                Err(_) => {
                    error!("subscriber message type mismatch");
                    Box::pin(std::future::ready(()))
                }
            }
        });

        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&command)
            .ok_or(NetError::UnknownCommand(command))?;
        entry.subscribers.push((id, erased));
        Ok(id)
    }

    /// Remove a subscriber by its identity token.
    pub fn remove_subscriber(&self, command: u16, id: SubscriberId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&command) else {
            return false;
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|(sid, _)| *sid != id);
        entry.subscribers.len() != before
    }

    /// Deserialize `payload` and fan it out to the command's subscribers.
    ///
    /// The snapshot is taken under the table lock; handlers run outside it
    /// on the worker pool, awaited in registration order. A panicking
    /// handler is caught and logged.
    pub async fn dispatch(
        &self,
        peer: Option<PeerKey>,
        response_id: u32,
        sink: Arc<dyn FrameSink>,
        command: u16,
        payload: &[u8],
    ) {
        let (decode, subscribers) = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(&command) else {
                warn!(command, "frame for unregistered command dropped");
                return;
            };
            (Arc::clone(&entry.decode), entry.subscribers.clone())
        };

        let Some(message) = decode(payload) else {
            return;
        };

        for (_, handler) in subscribers {
            let raw = RawDelivery {
                peer,
                response_id,
                message: Arc::clone(&message),
                sink: Arc::clone(&sink),
            };
            if let Err(e) = tokio::spawn(handler(raw)).await {
                if e.is_panic() {
                    error!(command, "subscriber panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::USER_COMMAND_LIMIT;
    use tokio::sync::Mutex as AsyncMutex;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send_frame(
            &self,
            _command: u16,
            _payload: &[u8],
            _response_id: u32,
        ) -> std::result::Result<(), SendError> {
            Ok(())
        }
    }

    struct RecordingSink {
        sent: AsyncMutex<Vec<(u16, Vec<u8>, u32)>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(
            &self,
            command: u16,
            payload: &[u8],
            response_id: u32,
        ) -> std::result::Result<(), SendError> {
            self.sent
                .lock()
                .await
                .push((command, payload.to_vec(), response_id));
            Ok(())
        }
    }

    fn sink() -> Arc<dyn FrameSink> {
        Arc::new(NullSink)
    }

    #[test]
    fn add_command_is_idempotent() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(7).unwrap();
        let id = table
            .add_subscriber::<Vec<u8>, _, _>(7, |_| async {})
            .unwrap();
        // repeat add keeps the existing entry (and its subscribers)
        table.add_command::<Vec<u8>>(7).unwrap();
        assert!(table.remove_subscriber(7, id));
    }

    #[test]
    fn reserved_command_rejected() {
        let table = DispatchTable::with_capacity(4);
        let err = table
            .add_command::<Vec<u8>>(USER_COMMAND_LIMIT + 1)
            .unwrap_err();
        assert!(matches!(err, NetError::ReservedCommand(_)));
    }

    #[test]
    fn subscriber_on_unregistered_command_rejected() {
        let table = DispatchTable::with_capacity(4);
        let err = table
            .add_subscriber::<Vec<u8>, _, _>(99, |_| async {})
            .unwrap_err();
        assert!(matches!(err, NetError::UnknownCommand(99)));
    }

    #[tokio::test]
    async fn dispatch_reaches_subscribers_in_order() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(1).unwrap();

        let order = Arc::new(AsyncMutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            table
                .add_subscriber::<Vec<u8>, _, _>(1, move |_| {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().await.push(tag);
                    }
                })
                .unwrap();
        }

        table.dispatch(None, 0, sink(), 1, b"x").await;
        assert_eq!(*order.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn removed_subscriber_receives_nothing() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(1).unwrap();

        let hits = Arc::new(AsyncMutex::new(0u32));
        let hits_clone = Arc::clone(&hits);
        let id = table
            .add_subscriber::<Vec<u8>, _, _>(1, move |_| {
                let hits = Arc::clone(&hits_clone);
                async move {
                    *hits.lock().await += 1;
                }
            })
            .unwrap();

        assert!(table.remove_subscriber(1, id));
        table.dispatch(None, 0, sink(), 1, b"x").await;
        assert_eq!(*hits.lock().await, 0);
    }

    #[tokio::test]
    async fn subscriber_added_later_sees_only_later_frames() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(1).unwrap();

        // two frames before anyone subscribes
        table.dispatch(None, 0, sink(), 1, b"a").await;
        table.dispatch(None, 0, sink(), 1, b"b").await;

        let seen = Arc::new(AsyncMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        table
            .add_subscriber::<Vec<u8>, _, _>(1, move |d| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().await.push(d.message.as_ref().clone());
                }
            })
            .unwrap();

        table.dispatch(None, 0, sink(), 1, b"c").await;
        assert_eq!(*seen.lock().await, vec![b"c".to_vec()]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<String>(2).unwrap();

        let hits = Arc::new(AsyncMutex::new(0u32));
        let hits_clone = Arc::clone(&hits);
        table
            .add_subscriber::<String, _, _>(2, move |_| {
                let hits = Arc::clone(&hits_clone);
                async move {
                    *hits.lock().await += 1;
                }
            })
            .unwrap();

        // not valid MessagePack for a string
        table.dispatch(None, 0, sink(), 2, &[0xC1]).await;
        assert_eq!(*hits.lock().await, 0);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_take_down_the_rest() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(3).unwrap();

        table
            .add_subscriber::<Vec<u8>, _, _>(3, |_| async {
                panic!("handler bug");
            })
            .unwrap();

        let hits = Arc::new(AsyncMutex::new(0u32));
        let hits_clone = Arc::clone(&hits);
        table
            .add_subscriber::<Vec<u8>, _, _>(3, move |_| {
                let hits = Arc::clone(&hits_clone);
                async move {
                    *hits.lock().await += 1;
                }
            })
            .unwrap();

        table.dispatch(None, 0, sink(), 3, b"x").await;
        assert_eq!(*hits.lock().await, 1);
    }

    #[tokio::test]
    async fn reply_preserves_response_id() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(42).unwrap();

        let recorder = Arc::new(RecordingSink {
            sent: AsyncMutex::new(Vec::new()),
        });
        table
            .add_subscriber::<Vec<u8>, _, _>(42, |d| async move {
                let _ = d.reply_raw(42, &d.message).await;
            })
            .unwrap();

        table
            .dispatch(None, 7, recorder.clone(), 42, &[0xDE, 0xAD])
            .await;

        let sent = recorder.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (42, vec![0xDE, 0xAD], 7));
    }

    #[tokio::test]
    async fn remove_command_releases_subscribers() {
        let table = DispatchTable::with_capacity(4);
        table.add_command::<Vec<u8>>(5).unwrap();
        table
            .add_subscriber::<Vec<u8>, _, _>(5, |_| async {})
            .unwrap();

        assert!(table.remove_command(5));
        assert!(!table.has_command(5));
        // frames for it now drop silently
        table.dispatch(None, 0, sink(), 5, b"x").await;
    }
}
