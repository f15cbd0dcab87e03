//! Side-effect hook fired when a campaign finishes successfully.
//!
//! Delivery is fire-and-forget: the scheduler spawns the call and a failure is
//! logged, never retried.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::Result;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSucceeded {
    pub campaign_address: String,
    /// Creator address; the original system resolved it to an email.
    pub recipient: String,
    pub campaign_title: String,
    /// Decimal wei.
    pub total_raised: String,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn campaign_succeeded(&self, notice: &CampaignSucceeded) -> Result<()>;
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn campaign_succeeded(&self, notice: &CampaignSucceeded) -> Result<()> {
        info!(
            campaign = %notice.campaign_address,
            recipient = %notice.recipient,
            total_raised = %notice.total_raised,
            "Campaign \"{}\" reached its goal",
            notice.campaign_title
        );
        Ok(())
    }
}

/// POSTs the notice as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn campaign_succeeded(&self, notice: &CampaignSucceeded) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(WEBHOOK_TIMEOUT)
            .json(notice)
            .send()
            .await?;

        if let Err(e) = response.error_for_status_ref() {
            warn!(
                campaign = %notice.campaign_address,
                status = %response.status(),
                "Notification webhook rejected the request"
            );
            return Err(e.into());
        }
        info!(campaign = %notice.campaign_address, "Notification webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Captures every notice it is handed.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<CampaignSucceeded>>,
    }

    impl RecordingNotifier {
        pub fn sent(&self) -> Vec<CampaignSucceeded> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn campaign_succeeded(&self, notice: &CampaignSucceeded) -> Result<()> {
            self.sent.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_camel_case() {
        let notice = CampaignSucceeded {
            campaign_address: "0xab".into(),
            recipient: "0x01".into(),
            campaign_title: "Solar Roofs".into(),
            total_raised: "10000000000000000000".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["campaignTitle"], "Solar Roofs");
        assert_eq!(json["totalRaised"], "10000000000000000000");
        assert_eq!(json["recipient"], "0x01");
    }

    #[tokio::test]
    async fn unreachable_webhook_is_an_error() {
        let notifier = WebhookNotifier::new(reqwest::Client::new(), "http://127.0.0.1:1/hook");
        let notice = CampaignSucceeded {
            campaign_address: "0xab".into(),
            recipient: "0x01".into(),
            campaign_title: "t".into(),
            total_raised: "1".into(),
        };
        assert!(notifier.campaign_succeeded(&notice).await.is_err());
    }
}
