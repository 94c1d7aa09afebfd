use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

/// An active subscription to one notification channel.
///
/// Dropping the subscription releases it on the broker side; there is no
/// separate unsubscribe call to forget on an error path.
pub struct Subscription {
    channel: String,
    messages: BoxStream<'static, Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, messages: BoxStream<'static, Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            messages,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message on the channel. `None` means the underlying connection closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.messages.next().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(channel = %self.channel, "subscription released");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
