//! A channel that delivers nothing and logs everything.

use std::sync::Mutex;

use async_trait::async_trait;
use supportflow_engine::{ChannelError, DeliveryReceipt, MessageChannel};
use tracing::info;
use uuid::Uuid;

/// One message the dry-run channel pretended to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunDelivery {
    pub platform: String,
    pub address: String,
    pub text: String,
}

/// Accepts every platform, logs each message at `info` and keeps a copy.
#[derive(Debug, Default)]
pub struct DryRunChannel {
    deliveries: Mutex<Vec<DryRunDelivery>>,
}

impl DryRunChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far, oldest first.
    pub fn deliveries(&self) -> Vec<DryRunDelivery> {
        self.deliveries
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageChannel for DryRunChannel {
    fn supports(&self, _platform: &str) -> bool {
        true
    }

    async fn deliver(
        &self,
        platform: &str,
        address: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, ChannelError> {
        info!(%platform, %address, %text, "dry-run delivery");
        if let Ok(mut deliveries) = self.deliveries.lock() {
            deliveries.push(DryRunDelivery {
                platform: platform.to_string(),
                address: address.to_string(),
                text: text.to_string(),
            });
        }
        Ok(DeliveryReceipt {
            platform: platform.to_string(),
            message_id: Some(format!("dry-run-{}", Uuid::now_v7())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_instead_of_sending() {
        let channel = DryRunChannel::new();
        let receipt = channel.deliver("sms", "+4912345", "hello").await.unwrap();
        assert!(receipt.message_id.unwrap().starts_with("dry-run-"));
        assert_eq!(
            channel.deliveries(),
            vec![DryRunDelivery {
                platform: "sms".into(),
                address: "+4912345".into(),
                text: "hello".into(),
            }]
        );
    }
}
