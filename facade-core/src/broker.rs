//! Broker abstraction and NATS JetStream binding
//!
//! A [`BrokerSession`] is one live connection: an ordered stream of
//! deliveries plus a close-notification channel. Deliveries are acknowledged
//! as soon as they are received, so a batch that later fails is not
//! redelivered.

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use async_nats::jetstream::{
    self,
    consumer::{self, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DELIVERY_BUFFER: usize = 256;

/// One unit of payload received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Raw message body
    pub payload: Bytes,
    /// Content type declared by the publisher, if any
    pub content_type: Option<String>,
}

impl Delivery {
    /// Delivery without a declared content type
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            content_type: None,
        }
    }

    /// Attach a content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A live broker connection
pub struct BrokerSession {
    /// Deliveries in broker order; closes when the consumer stream ends
    pub deliveries: mpsc::Receiver<Delivery>,
    /// Close notifications raised while consuming
    pub closed: mpsc::UnboundedReceiver<String>,
    tasks: Vec<JoinHandle<()>>,
    client: Option<async_nats::Client>,
}

impl BrokerSession {
    /// Session over caller-owned channels
    pub fn new(
        deliveries: mpsc::Receiver<Delivery>,
        closed: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            deliveries,
            closed,
            tasks: Vec::new(),
            client: None,
        }
    }

    /// Tear down the consumer and drop the connection
    pub fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.client.take().is_some() {
            debug!("Broker connection dropped");
        }
    }
}

/// Opens broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Dial, declare the durable queue and start consuming. Nothing is left
    /// open when this fails.
    async fn connect(&self) -> Result<BrokerSession>;
}

/// JetStream connector: durable file-backed stream, durable pull consumer
pub struct NatsConnector {
    config: BrokerConfig,
}

impl NatsConnector {
    /// Connector for `config`
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.config.stream.clone(),
            description: Some("Sensor readings awaiting scoring".to_string()),
            subjects: vec![self.config.subject.clone()],
            retention: RetentionPolicy::WorkQueue,
            storage: StorageType::File,
            ..Default::default()
        }
    }

    fn consumer_config(&self) -> consumer::pull::Config {
        consumer::pull::Config {
            durable_name: Some(self.config.durable_name.clone()),
            description: Some("ml-facade intake".to_string()),
            filter_subject: self.config.subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: consumer::DeliverPolicy::All,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn connect(&self) -> Result<BrokerSession> {
        info!("Connecting to NATS at {}", self.config.url);

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let notify = closed_tx.clone();

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .event_callback(move |event| {
                let notify = notify.clone();
                async move {
                    if let async_nats::Event::Disconnected = event {
                        let _ = notify.send("connection lost".to_string());
                    }
                }
            })
            .connect(&self.config.url)
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        let context = jetstream::new(client.clone());
        let stream = context
            .get_or_create_stream(self.stream_config())
            .await
            .map_err(|e| Error::Broker(format!("stream {}: {}", self.config.stream, e)))?;

        let consumer: PullConsumer = stream
            .create_consumer(self.consumer_config())
            .await
            .map_err(|e| Error::Broker(format!("consumer {}: {}", self.config.durable_name, e)))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Broker(e.to_string()))?;

        info!(
            stream = %self.config.stream,
            durable = %self.config.durable_name,
            "JetStream consumer ready"
        );

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let pump = tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(msg) => {
                        if let Err(e) = msg.ack().await {
                            warn!("Failed to ack delivery: {}", e);
                        }
                        let content_type = msg
                            .headers
                            .as_ref()
                            .and_then(|h| h.get("Content-Type"))
                            .map(|v| v.to_string());
                        let delivery = Delivery {
                            payload: msg.payload.clone(),
                            content_type,
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = closed_tx.send(e.to_string());
                        break;
                    }
                }
            }
        });

        Ok(BrokerSession {
            deliveries: rx,
            closed: closed_rx,
            tasks: vec![pump],
            client: Some(client),
        })
    }
}
