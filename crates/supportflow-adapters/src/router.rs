//! Fan-in of several channels behind one [`MessageChannel`].

use std::sync::Arc;

use async_trait::async_trait;
use supportflow_engine::{ChannelError, DeliveryReceipt, MessageChannel};

/// Routes each delivery to the first registered channel supporting the
/// target platform.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    channels: Vec<Arc<dyn MessageChannel>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel. Earlier channels win when several support a platform.
    pub fn with(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn route(&self, platform: &str) -> Option<&Arc<dyn MessageChannel>> {
        self.channels.iter().find(|c| c.supports(platform))
    }
}

#[async_trait]
impl MessageChannel for ChannelRouter {
    fn supports(&self, platform: &str) -> bool {
        self.route(platform).is_some()
    }

    async fn deliver(
        &self,
        platform: &str,
        address: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, ChannelError> {
        match self.route(platform) {
            Some(channel) => channel.deliver(platform, address, text).await,
            None => Err(ChannelError::Unsupported(platform.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunChannel;

    struct Only(&'static str);

    #[async_trait]
    impl MessageChannel for Only {
        fn supports(&self, platform: &str) -> bool {
            platform == self.0
        }

        async fn deliver(
            &self,
            platform: &str,
            _address: &str,
            _text: &str,
        ) -> Result<DeliveryReceipt, ChannelError> {
            Ok(DeliveryReceipt {
                platform: platform.to_string(),
                message_id: Some(self.0.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn first_supporting_channel_wins() {
        let router = ChannelRouter::new()
            .with(Arc::new(Only("telegram")))
            .with(Arc::new(DryRunChannel::new()));

        let receipt = router.deliver("telegram", "1", "hi").await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("telegram"));

        let receipt = router.deliver("sms", "1", "hi").await.unwrap();
        assert!(receipt.message_id.unwrap().starts_with("dry-run-"));
    }

    #[tokio::test]
    async fn unsupported_platform_is_reported() {
        let router = ChannelRouter::new().with(Arc::new(Only("telegram")));
        assert!(!router.supports("whatsapp"));
        let err = router.deliver("whatsapp", "1", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::Unsupported(p) if p == "whatsapp"));
    }
}
