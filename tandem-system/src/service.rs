use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// A message interface for [services](Service).
///
/// Most commonly, this is an enum of the messages a service can handle, each carrying the
/// [`Sender`] for its response where one is expected.
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// Describes how a service responds to a message.
///
/// This is implemented by [`NoResponse`] for fire-and-forget messages and by [`AsyncResponse`]
/// for messages that produce a value.
pub trait MessageResponse {
    /// Sends the response from the service back to the requester.
    type Sender;

    /// The output returned to the caller of [`Addr::send`].
    type Output;

    /// Creates a connected pair of sender and output.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The message does not expect a response.
///
/// Sending such a message never fails visibly. If the service has stopped, the message is
/// dropped.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// The message is answered asynchronously through a [`Sender`].
///
/// The caller receives a [`Request`] future that resolves once the service responds.
pub struct AsyncResponse<T>(PhantomData<fn(T)>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender { tx }, Request { rx })
    }
}

/// Sends the response of an [`AsyncResponse`] message.
pub struct Sender<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Sender<T> {
    /// Sends the response value.
    ///
    /// If the requester has gone away in the meanwhile, the value is dropped.
    pub fn send(self, value: T) {
        self.tx.send(value).ok();
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.tx.is_closed())
            .finish()
    }
}

/// The future returned from [`Addr::send`] for messages with an [`AsyncResponse`].
///
/// Resolves to [`SendError`] if the service stopped before responding.
#[must_use = "futures do nothing unless awaited"]
pub struct Request<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| SendError))
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Request")
    }
}

/// Declares a message as part of an [`Interface`].
///
/// The implementation wraps the message and its response sender into the interface type.
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running. They can be freely cloned.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// The communication channel with the service is unbounded, so backlogs could occur when
    /// sending too many messages.
    pub fn send<M>(
        &self,
        message: M,
    ) -> <<I as FromMessage<M>>::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (sender, output) =
            <<I as FromMessage<M>>::Response as MessageResponse>::channel();
        self.queue_size.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(I::from_message(message, sender)).is_err() {
            self.queue_size.fetch_sub(1, Ordering::Relaxed);
        }
        output
    }

    /// Returns the number of messages queued up but not yet handled by the service.
    pub fn len(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Returns `true` if no messages are waiting in the inbox of the service.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the service has stopped and dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue_size: self.queue_size.clone(),
        }
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.len())
            .finish()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    name: &'static str,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// Returns `None` once all addresses have been dropped.
    pub async fn recv(&mut self) -> Option<I> {
        let value = self.rx.recv().await;
        if value.is_some() {
            self.queue_size.fetch_sub(1, Ordering::Relaxed);
        }
        value
    }

    /// The name of the service this receiver belongs to.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
///
/// The `name` is used in logs to identify the service.
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        queue_size: queue_size.clone(),
    };

    let receiver = Receiver {
        rx,
        name,
        queue_size,
    };

    (addr, receiver)
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle them
/// one by one. Internally, services are free to concurrently process these messages or not.
///
/// The service is spawned on the current tokio runtime by [`start`](Self::start). The typical
/// implementation of [`spawn_handler`](Self::spawn_handler) spawns a task that runs a
/// `tokio::select!` loop over the receiver, internal channels and a [`ShutdownHandle`].
///
/// [`ShutdownHandle`]: crate::ShutdownHandle
pub trait Service: Sized {
    /// The interface of messages this service implements.
    type Interface: Interface;

    /// Spawns a task to handle service messages.
    fn spawn_handler(self, rx: Receiver<Self::Interface>);

    /// Starts the service in the current runtime and returns an address for it.
    fn start(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        self.spawn_handler(rx);
        addr
    }

    /// Returns a unique name for this service implementation.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Increment;
    struct GetCount;

    enum Counter {
        Increment,
        GetCount(Sender<u64>),
    }

    impl Interface for Counter {}

    impl FromMessage<Increment> for Counter {
        type Response = NoResponse;

        fn from_message(_: Increment, _: ()) -> Self {
            Self::Increment
        }
    }

    impl FromMessage<GetCount> for Counter {
        type Response = AsyncResponse<u64>;

        fn from_message(_: GetCount, sender: Sender<u64>) -> Self {
            Self::GetCount(sender)
        }
    }

    struct CounterService {
        count: u64,
        stop_after: u64,
    }

    impl Service for CounterService {
        type Interface = Counter;

        fn spawn_handler(mut self, mut rx: Receiver<Self::Interface>) {
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    match message {
                        Counter::Increment => self.count += 1,
                        Counter::GetCount(sender) => sender.send(self.count),
                    }

                    if self.count >= self.stop_after {
                        break;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_send_and_respond() {
        let addr = CounterService {
            count: 0,
            stop_after: u64::MAX,
        }
        .start();

        addr.send(Increment);
        addr.send(Increment);

        assert_eq!(addr.send(GetCount).await, Ok(2));
    }

    #[tokio::test]
    async fn test_send_after_stop() {
        let addr = CounterService {
            count: 0,
            stop_after: 1,
        }
        .start();

        addr.send(Increment);
        assert_eq!(addr.send(GetCount).await, Err(SendError));
        assert!(addr.is_closed());
    }

    #[tokio::test]
    async fn test_queue_size() {
        let (addr, mut rx) = channel::<Counter>("counter");

        addr.send(Increment);
        addr.send(Increment);
        assert_eq!(addr.len(), 2);

        assert!(rx.recv().await.is_some());
        assert_eq!(addr.len(), 1);
        assert_eq!(rx.name(), "counter");
    }
}
