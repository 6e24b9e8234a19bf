//! SMS delivery through an HTTP gateway.

use serde::Serialize;

use crate::config::NotifyConfig;
use crate::driver::BoxFuture;
use crate::{AppError, Result};

use super::{Notification, NotificationSink};

/// `POST api_url` with a bearer key and `{to, message}`.
#[derive(Clone)]
pub struct SmsSink {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct SmsBody<'a> {
    to: &'a str,
    message: &'a str,
}

impl SmsSink {
    /// Build a sink from configuration; the key must already be loaded.
    #[must_use]
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&SmsBody {
                to: &notification.recipient,
                message: &notification.message,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|e| AppError::Notify(format!("sms gateway: {e}")))
    }
}

impl NotificationSink for SmsSink {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, ()> {
        Box::pin(self.deliver(notification))
    }
}
