use std::sync::Arc;

use tracing::{info, warn};

use crate::cloud::CloudContext;
use crate::error::PipelineError;

/// Failure alerts delivered to an external pub/sub channel.
pub trait Notifier {
    fn publish(&self, subject: &str, message: &str) -> Result<(), PipelineError>;
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    fn publish(&self, subject: &str, message: &str) -> Result<(), PipelineError> {
        (**self).publish(subject, message)
    }
}

impl<T: Notifier + ?Sized> Notifier for &T {
    fn publish(&self, subject: &str, message: &str) -> Result<(), PipelineError> {
        (**self).publish(subject, message)
    }
}

pub struct SnsNotifier {
    cloud: Arc<CloudContext>,
    client: aws_sdk_sns::Client,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(cloud: Arc<CloudContext>, topic_arn: impl Into<String>) -> Self {
        let client = cloud.sns_client();
        Self {
            cloud,
            client,
            topic_arn: topic_arn.into(),
        }
    }
}

impl Notifier for SnsNotifier {
    fn publish(&self, subject: &str, message: &str) -> Result<(), PipelineError> {
        info!(topic = %self.topic_arn, subject, "publishing alert");
        self.cloud.block_on(async {
            self.client
                .publish()
                .topic_arn(&self.topic_arn)
                .subject(subject)
                .message(message)
                .send()
                .await
                .map_err(|err| PipelineError::Notification(err.into_service_error().to_string()))?;
            Ok::<(), PipelineError>(())
        })
    }
}

/// Used when no topic is configured: the alert only reaches the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, subject: &str, message: &str) -> Result<(), PipelineError> {
        warn!(subject, message, "no alert topic configured; alert logged only");
        Ok(())
    }
}
