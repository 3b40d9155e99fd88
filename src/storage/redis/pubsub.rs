//! Pub/sub side of the Redis store.
//!
//! A single task owns the subscribed connection. It forwards incoming
//! messages and serves subscription requests, answering each request only
//! after Redis has acknowledged it.

use async_trait::async_trait;
use futures::StreamExt;
use redis::Client;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::interfaces::{ChannelMessage, PubSub};

#[derive(Debug, Clone, Copy)]
enum Op {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

struct Request {
    op: Op,
    target: String,
    ack: oneshot::Sender<Result<()>>,
}

/// Handle to the listener task. Dropping it stops the task.
pub struct RedisPubSub {
    requests: mpsc::UnboundedSender<Request>,
}

impl RedisPubSub {
    pub async fn connect(
        client: &Client,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelMessage>)> {
        let pubsub = client.get_async_pubsub().await?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(pubsub, request_rx, message_tx));

        Ok((
            Self {
                requests: request_tx,
            },
            message_rx,
        ))
    }

    async fn request(&self, op: Op, target: &str) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.requests
            .send(Request {
                op,
                target: target.to_string(),
                ack,
            })
            .map_err(|_| Error::ListenerClosed)?;
        done.await.map_err(|_| Error::ListenerClosed)?
    }
}

fn to_message(msg: &redis::Msg) -> Option<ChannelMessage> {
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(channel = %msg.get_channel_name(), error = %e, "Dropping non-UTF-8 message");
            return None;
        }
    };
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    Some(ChannelMessage {
        pattern,
        channel: msg.get_channel_name().to_string(),
        payload,
    })
}

async fn pump(
    mut pubsub: redis::aio::PubSub,
    mut requests: mpsc::UnboundedReceiver<Request>,
    messages: mpsc::UnboundedSender<ChannelMessage>,
) {
    loop {
        let request = {
            let mut stream = pubsub.on_message();
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(msg) => {
                        if let Some(message) = to_message(&msg) {
                            if messages.send(message).is_err() {
                                debug!("Message receiver dropped, stopping listener");
                                return;
                            }
                        }
                        continue;
                    }
                    None => {
                        error!("Redis pub/sub connection closed");
                        return;
                    }
                },
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            }
        };

        let result = match request.op {
            Op::Subscribe => pubsub.subscribe(&request.target).await,
            Op::Unsubscribe => pubsub.unsubscribe(&request.target).await,
            Op::PSubscribe => pubsub.psubscribe(&request.target).await,
            Op::PUnsubscribe => pubsub.punsubscribe(&request.target).await,
        };
        debug!(op = ?request.op, target = %request.target, ok = result.is_ok(), "Pub/sub request");
        let _ = request.ack.send(result.map_err(Error::from));
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.request(Op::Subscribe, channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.request(Op::Unsubscribe, channel).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.request(Op::PSubscribe, pattern).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.request(Op::PUnsubscribe, pattern).await
    }
}
