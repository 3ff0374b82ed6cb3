use std::{future::Future, time::Duration};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::Filter;
use aws_sdk_ssm::error::DisplayErrorContext;
use tracing::debug;

use super::{CloudError, Instance, InstanceProvider, Parameter, ParameterStore};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RUNNING: &str = "running";

/// Parameter store and instance provider backed by SSM and EC2.
pub struct AwsClient {
    ssm: aws_sdk_ssm::Client,
    ec2: aws_sdk_ec2::Client,
    call_timeout: Duration,
}
impl AwsClient {
    /// Loads credentials from the default chain; `region` and `profile` override it when set.
    pub async fn new(region: Option<String>, profile: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        debug!("aws region: {:?}", config.region());
        AwsClient {
            ssm: aws_sdk_ssm::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
    async fn call<T, E>(
        &self,
        operation: &'static str,
        request: impl Future<Output = Result<T, E>>,
    ) -> Result<T, CloudError>
    where
        E: std::error::Error,
    {
        match tokio::time::timeout(self.call_timeout, request).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CloudError::Request {
                operation,
                message: DisplayErrorContext(e).to_string(),
            }),
            Err(_) => Err(CloudError::Timeout { operation }),
        }
    }
}

#[async_trait]
impl ParameterStore for AwsClient {
    async fn get_parameter(&self, name: &str) -> Result<String, CloudError> {
        let output = self
            .call(
                "GetParameter",
                self.ssm
                    .get_parameter()
                    .name(name)
                    .with_decryption(true)
                    .send(),
            )
            .await?;
        output
            .parameter()
            .and_then(|p| p.value())
            .map(String::from)
            .ok_or_else(|| CloudError::MissingValue(name.to_string()))
    }
    async fn get_parameters(&self, names: &[String]) -> Result<Vec<Parameter>, CloudError> {
        let output = self
            .call(
                "GetParameters",
                self.ssm
                    .get_parameters()
                    .set_names(Some(names.to_vec()))
                    .with_decryption(true)
                    .send(),
            )
            .await?;
        debug!("found {} parameters in batch", output.parameters().len());
        if !output.invalid_parameters().is_empty() {
            debug!("invalid parameters: {:?}", output.invalid_parameters());
        }
        Ok(output
            .parameters()
            .iter()
            .filter_map(|p| match (p.name(), p.value()) {
                (Some(name), Some(value)) => Some(Parameter {
                    name: name.to_string(),
                    value: value.to_string(),
                }),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl InstanceProvider for AwsClient {
    async fn describe_running_instances_by_name_filter(
        &self,
        filter: &str,
    ) -> Result<Vec<Instance>, CloudError> {
        let output = self
            .call(
                "DescribeInstances",
                self.ec2
                    .describe_instances()
                    .filters(Filter::builder().name("tag:Name").values(filter).build())
                    .filters(
                        Filter::builder()
                            .name("instance-state-name")
                            .values(RUNNING)
                            .build(),
                    )
                    .send(),
            )
            .await?;
        let instances = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(|instance| {
                let id = instance.instance_id()?.to_string();
                let name = instance
                    .tags()
                    .iter()
                    .find(|t| t.key() == Some("Name"))
                    .and_then(|t| t.value())
                    .map(String::from);
                let state = instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|n| n.as_str().to_string())
                    .unwrap_or_default();
                Some(Instance {
                    id,
                    name,
                    private_ip: instance.private_ip_address().map(String::from),
                    state,
                })
            })
            .collect();
        Ok(instances)
    }
}
