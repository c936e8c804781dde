use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bus::codec::EnvelopeCodec;
use crate::bus::protocol::{Channel, Envelope, Inbound};
use crate::api::JsonMap;
use crate::error::{Error, Result};

/// Anything the bus can ride on: a TCP stream in production, an in-memory
/// duplex pipe in tests.
pub trait BusStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BusStream for T {}

type DynStream = Box<dyn BusStream>;

/// Receives every decoded inbound message, each on its own task.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, message: Inbound) -> Result<()>;
}

/// Publish half of a bus session. Cheap to clone; all clones feed the same
/// writer task. Publishing is fire-and-forget: the bus performs no retries
/// and gives no delivery acknowledgment.
#[derive(Debug, Clone)]
pub struct BusClient {
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl BusClient {
    /// Establishes a transport session with the event bus.
    pub async fn connect(addr: &str) -> Result<(BusClient, BusListener)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("cannot reach bus at {}: {}", addr, e)))?;
        log::info!("Connected to bus at {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Builds a session over an already-open stream. Tests hand in a
    /// `tokio::io::duplex` pipe here.
    pub fn from_stream(stream: impl BusStream + 'static) -> (BusClient, BusListener) {
        let stream: DynStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);

        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = sink.send(envelope).await {
                    log::error!("Bus write failed, dropping session: {}", e);
                    break;
                }
            }
        });

        let frames = FramedRead::new(read_half, EnvelopeCodec::new());
        (BusClient { outbound: tx }, BusListener { frames, writer })
    }

    /// Fire-and-forget publish. Fails with `Error::Connection` when no
    /// session is active; retrying is the caller's concern.
    pub fn publish(&self, channel: Channel, data: JsonMap) -> Result<()> {
        log::debug!("Publishing on '{}'", channel.as_str());
        self.outbound
            .send(Envelope::new(channel, data))
            .map_err(|_| Error::Connection("no active bus session".to_string()))
    }
}

/// Receive half of a bus session: one long-lived loop that fans every
/// message out to its own handler task.
pub struct BusListener {
    frames: FramedRead<ReadHalf<DynStream>, EnvelopeCodec>,
    writer: JoinHandle<()>,
}

impl BusListener {
    /// Runs the receive loop until the peer closes the stream or the
    /// shutdown signal flips.
    ///
    /// Each inbound frame is decoded and dispatched on an independent task
    /// so a slow handler never blocks subsequent delivery. Handler errors
    /// and panics are logged at this boundary and never kill the loop.
    /// Malformed frames are dropped one at a time; unrecognized channels are
    /// warned about and ignored.
    pub async fn run(mut self, channels: &[Channel], dispatcher: Arc<dyn Dispatch>, mut shutdown: watch::Receiver<bool>) {
        let subscribed: HashSet<Channel> = channels.iter().copied().collect();
        log::info!("Listening on {} subscribed channels", subscribed.len());

        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("Bus listener shutting down");
                    break;
                }
                frame = self.frames.next() => {
                    match frame {
                        None => {
                            log::warn!("Bus session closed by peer");
                            break;
                        }
                        Some(Err(e)) => log::error!("Dropping undecodable frame: {}", e),
                        Some(Ok(envelope)) => Self::dispatch_frame(envelope, &subscribed, &dispatcher, &mut handlers),
                    }
                }
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Message handler aborted: {}", e);
                    }
                }
            }
        }

        // Drain in-flight handlers before tearing the session down.
        while let Some(finished) = handlers.join_next().await {
            if let Err(e) = finished {
                log::error!("Message handler aborted: {}", e);
            }
        }
        self.writer.abort();
    }

    fn dispatch_frame(envelope: Envelope, subscribed: &HashSet<Channel>, dispatcher: &Arc<dyn Dispatch>, handlers: &mut JoinSet<()>) {
        let Some(channel) = Channel::parse(&envelope.channel) else {
            log::warn!("Ignoring message on unrecognized channel '{}'", envelope.channel);
            return;
        };
        if !subscribed.contains(&channel) {
            log::debug!("Ignoring message on unsubscribed channel '{}'", envelope.channel);
            return;
        }

        match Inbound::decode(channel, envelope.data) {
            Err(e) => log::error!("Dropping malformed message: {}", e),
            Ok(None) => log::debug!("No inbound handling for channel '{}'", envelope.channel),
            Ok(Some(message)) => {
                let dispatcher = dispatcher.clone();
                handlers.spawn(async move {
                    if let Err(e) = dispatcher.dispatch(message).await {
                        log::error!("Handler failed on '{}': {}", channel.as_str(), e);
                    }
                });
            }
        }
    }
}
