use super::{Transport, TransportEvent};
use crate::error::TransportError;
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::{sync::mpsc, time::Instant};
use url::Url;

/// Scripted reply generator, invoked with every frame sent over the mock.
pub(crate) type Responder = Box<dyn FnMut(&str) -> Vec<TransportEvent> + Send>;

/// Observation side of a [`MockTransport`].
#[derive(Clone)]
pub(crate) struct MockHandle {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub connects: Arc<Mutex<Vec<Instant>>>,
}

impl MockHandle {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|frame| {
                serde_json::from_str::<serde_json::Value>(frame)
                    .ok()?
                    .get("method")?
                    .as_str()
                    .map(str::to_string)
            })
            .collect()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// In-memory [`Transport`]: connect results are scripted, inbound events are fed from the
/// responder and the [`MockHandle`], outbound frames are recorded.
pub(crate) struct MockTransport {
    connect_results: VecDeque<Result<(), TransportError>>,
    responder: Responder,
    replies: VecDeque<TransportEvent>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    connects: Arc<Mutex<Vec<Instant>>>,
    connected: bool,
}

impl MockTransport {
    pub fn new(
        connect_results: impl IntoIterator<Item = Result<(), TransportError>>,
        responder: Responder,
    ) -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(Mutex::new(Vec::new()));

        let transport = Self {
            connect_results: connect_results.into_iter().collect(),
            responder,
            replies: VecDeque::new(),
            events: rx,
            sent: sent.clone(),
            connects: connects.clone(),
            connected: false,
        };
        let handle = MockHandle {
            events: tx,
            sent,
            connects,
        };
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, url: &Url) -> Result<(), TransportError> {
        self.connects.lock().unwrap().push(Instant::now());
        self.replies.clear();

        let result = self.connect_results.pop_front().unwrap_or(Ok(()));
        if let Err(error) = &result {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: error.to_string(),
            });
        }
        self.connected = true;
        result
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let replies = (self.responder)(&text);
        self.replies.extend(replies);
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        let event = match self.replies.pop_front() {
            Some(event) => event,
            None => match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            },
        };
        if matches!(event, TransportEvent::Closed { .. }) {
            self.connected = false;
        }
        event
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}
