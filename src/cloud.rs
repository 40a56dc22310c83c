use std::future::Future;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::ProvideCredentials;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::AwsSettings;
use crate::credentials::AwsCredentialSource;
use crate::error::PipelineError;

/// Shared AWS configuration plus the runtime every SDK call is driven on.
///
/// Calls block the current thread, so adapters built on top of this stay
/// synchronous.
pub struct CloudContext {
    runtime: Runtime,
    sdk_config: SdkConfig,
    path_style: bool,
}

impl CloudContext {
    pub fn new(settings: &AwsSettings) -> Result<Arc<Self>, PipelineError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| PipelineError::Runtime(err.to_string()))?;

        let source = AwsCredentialSource::from_settings(settings);
        debug!(region = %settings.region, source = ?source, "loading AWS configuration");

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        loader = match source {
            AwsCredentialSource::DefaultChain => loader,
            AwsCredentialSource::Profile(name) => loader.profile_name(name),
            AwsCredentialSource::Static(keys) => loader.credentials_provider(Credentials::new(
                keys.access_key_id,
                keys.secret_access_key,
                keys.session_token,
                None,
                "vsp-config",
            )),
        };
        let sdk_config = runtime.block_on(loader.load());

        let context = Self {
            runtime,
            sdk_config,
            path_style: settings.endpoint_url.is_some(),
        };
        context.ensure_credentials()?;
        Ok(Arc::new(context))
    }

    /// Resolves credentials once so a missing setup fails before any request.
    pub fn ensure_credentials(&self) -> Result<(), PipelineError> {
        let provider = self.sdk_config.credentials_provider().ok_or_else(|| {
            PipelineError::CredentialsMissing("no AWS credentials provider configured".to_string())
        })?;
        self.runtime
            .block_on(provider.provide_credentials())
            .map(|_| ())
            .map_err(|err| PipelineError::CredentialsMissing(err.to_string()))
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn s3_client(&self) -> aws_sdk_s3::Client {
        let config = aws_sdk_s3::config::Builder::from(&self.sdk_config)
            .force_path_style(self.path_style)
            .build();
        aws_sdk_s3::Client::from_conf(config)
    }

    pub fn athena_client(&self) -> aws_sdk_athena::Client {
        aws_sdk_athena::Client::new(&self.sdk_config)
    }

    pub fn sns_client(&self) -> aws_sdk_sns::Client {
        aws_sdk_sns::Client::new(&self.sdk_config)
    }
}
