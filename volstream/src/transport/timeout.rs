use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

/// Default idle read timeout of a feed connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper that terminates the inner WebSocket read half if no frame arrives within
/// `timeout`.
///
/// Termination surfaces to the [`Transport`](super::Transport) as an abnormal close, so a
/// silently dead connection goes through the normal reconnect path.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
    timed_out: bool,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timed_out: false,
        }
    }

    /// True once the stream has ended because of the idle timeout.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    type Item = Result<Message, tungstenite::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        let timeout = self.timeout;
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "feed read timeout, no data received"
                    );
                    self.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    fn channel_stream(
        rx: mpsc::UnboundedReceiver<Result<Message, tungstenite::Error>>,
    ) -> impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin {
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stream_ends_when_idle() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = TimeoutStream::new(channel_stream(rx), Duration::from_secs(5));

        tx.send(Ok(Message::text("first"))).unwrap();
        assert!(matches!(stream.next().await, Some(Ok(Message::Text(_)))));

        // Activity within the timeout keeps the stream alive
        tokio::time::sleep(Duration::from_secs(4)).await;
        tx.send(Ok(Message::text("second"))).unwrap();
        assert!(matches!(stream.next().await, Some(Ok(Message::Text(_)))));
        assert!(!stream.timed_out());

        assert!(stream.next().await.is_none());
        assert!(stream.timed_out());

        // Stays terminated even if the inner stream has more data
        tx.send(Ok(Message::text("late"))).unwrap();
        assert!(stream.next().await.is_none());
    }
}
