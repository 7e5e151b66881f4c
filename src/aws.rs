//! AWS SDK clients.

pub mod ecr;
pub mod s3;

use aws_config::SdkConfig;
use tracing::debug;

/// Load the shared SDK configuration, honouring an explicit profile and region.
pub async fn load_config(profile: Option<&str>, region: Option<&str>) -> SdkConfig {
    let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

    if let Some(profile) = profile {
        debug!("Using AWS profile: {}", profile);
        config_loader = config_loader.profile_name(profile);
    }

    if let Some(region) = region {
        debug!("Using AWS region: {}", region);
        config_loader = config_loader.region(aws_config::Region::new(region.to_string()));
    }

    config_loader.load().await
}
