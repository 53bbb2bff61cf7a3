//! Shared AWS SDK configuration.

use aws_config::BehaviorVersion;
use aws_config::SdkConfig;
use aws_credential_types::Credentials;
use aws_sdk_emr::config::Region;

use atmo_core::config::AwsConfig;

/// Load SDK config for `aws`.
///
/// Uses the default provider chain unless static credentials are configured
/// (local dev / explicit config). The endpoint override only applies when
/// `AWS_ENDPOINT_URL` is set for the active profile.
pub async fn load_sdk_config(aws: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(aws.region.clone()));

    if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
        let creds = Credentials::new(
            key_id,
            secret,
            aws.session_token.clone(),
            None,
            "atmo-static",
        );
        loader = loader.credentials_provider(creds);
    }

    if let Some(endpoint) = aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
        loader = loader.endpoint_url(normalize_endpoint(endpoint));
    }

    loader.load().await
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}
