use std::io::Cursor;

use anyhow::{Context, Result};
use async_trait::async_trait;
use web_push::{
    ContentEncoding, SubscriptionInfo, VapidSignatureBuilder, WebPushClient, WebPushError,
    WebPushMessageBuilder,
};

use crate::compose::NotificationPayload;
use crate::model::Subscription;

/// Result of one delivery attempt. `Gone` means the receiving platform no
/// longer accepts messages for the endpoint (404/410), which is the caller's
/// signal to prune the subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered,
    Gone,
    TransientFailure(String),
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, subscription: &Subscription, payload: &NotificationPayload)
        -> SendOutcome;
}

/// VAPID signing material. Absent keys put the whole subsystem into a
/// degraded no-send mode rather than failing requests.
#[derive(Clone)]
pub struct VapidConfig {
    pub public_key: String,
    pub private_key: Vec<u8>,
}

impl VapidConfig {
    pub fn from_env() -> Result<Option<Self>> {
        let public_key = std::env::var("NUDGE_VAPID_PUBKEY");
        let private_key = std::env::var("NUDGE_VAPID_PRIVKEY");

        match (public_key, private_key) {
            (Ok(public_key), Ok(private_key)) => {
                let private_key = base64::decode(&private_key)
                    .context("NUDGE_VAPID_PRIVKEY is not valid base64")?;

                Ok(Some(VapidConfig {
                    public_key,
                    private_key,
                }))
            }
            _ => {
                tracing::warn!(
                    "NUDGE_VAPID_PUBKEY / NUDGE_VAPID_PRIVKEY not set; push delivery disabled."
                );

                Ok(None)
            }
        }
    }
}

/// Sends VAPID-signed messages through the Web Push protocol.
pub struct WebPushSender {
    private_key: Vec<u8>,
}

impl WebPushSender {
    pub fn new(config: &VapidConfig) -> Self {
        WebPushSender {
            private_key: config.private_key.clone(),
        }
    }

    async fn try_send(
        &self,
        subscription: &Subscription,
        payload_json: &str,
    ) -> std::result::Result<(), WebPushError> {
        let subscription_info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.p256dh.clone(),
            subscription.auth.clone(),
        );

        let cursor = Cursor::new(&self.private_key);
        let sig_builder = VapidSignatureBuilder::from_der_no_sub(cursor)?;
        let signature = sig_builder.add_sub_info(&subscription_info).build()?;

        let mut builder = WebPushMessageBuilder::new(&subscription_info)?;
        builder.set_payload(ContentEncoding::Aes128Gcm, payload_json.as_bytes());
        builder.set_vapid_signature(signature);

        let client = WebPushClient::new()?;
        client.send(builder.build()?).await?;

        Ok(())
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &NotificationPayload,
    ) -> SendOutcome {
        let payload_json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(error) => return SendOutcome::TransientFailure(format!("{:?}", error)),
        };

        match self.try_send(subscription, &payload_json).await {
            Ok(()) => SendOutcome::Delivered,
            Err(error) => classify(error),
        }
    }
}

fn classify(error: WebPushError) -> SendOutcome {
    match error {
        WebPushError::EndpointNotFound | WebPushError::EndpointNotValid => SendOutcome::Gone,
        other => SendOutcome::TransientFailure(format!("{:?}", other)),
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Scripted sender for tests: outcomes keyed by endpoint, `Delivered`
    /// unless told otherwise. Records every attempted send.
    pub struct StubSender {
        outcomes: HashMap<String, SendOutcome>,
        pub sent: Mutex<Vec<(String, NotificationPayload)>>,
    }

    impl StubSender {
        pub fn delivering() -> Self {
            StubSender {
                outcomes: HashMap::new(),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn with_outcome(mut self, endpoint: &str, outcome: SendOutcome) -> Self {
            self.outcomes.insert(endpoint.to_string(), outcome);
            self
        }

        pub fn sent_endpoints(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("stub sender mutex")
                .iter()
                .map(|(endpoint, _)| endpoint.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PushSender for StubSender {
        async fn send(
            &self,
            subscription: &Subscription,
            payload: &NotificationPayload,
        ) -> SendOutcome {
            self.sent
                .lock()
                .expect("stub sender mutex")
                .push((subscription.endpoint.clone(), payload.clone()));

            self.outcomes
                .get(&subscription.endpoint)
                .cloned()
                .unwrap_or(SendOutcome::Delivered)
        }
    }

    #[test]
    fn gone_classification_covers_both_endpoint_errors() {
        assert_eq!(classify(WebPushError::EndpointNotFound), SendOutcome::Gone);
        assert_eq!(classify(WebPushError::EndpointNotValid), SendOutcome::Gone);
        assert!(matches!(
            classify(WebPushError::ServerError(None)),
            SendOutcome::TransientFailure(_)
        ));
    }
}
