use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::cloud::{Instance, InstanceProvider};

use super::{resolver::substitute_placeholder, tunnel::TunnelError};

const UNNAMED: &str = "unnamed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Jumphost {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
}
impl From<Instance> for Jumphost {
    fn from(instance: Instance) -> Self {
        Jumphost {
            id: instance.id,
            name: instance.name.unwrap_or_else(|| UNNAMED.to_string()),
            address: instance.private_ip,
        }
    }
}

/// Picks a random running instance whose `Name` tag matches the environment's filter.
/// Queries the provider on every call.
pub(crate) struct JumphostSelector {
    provider: Arc<dyn InstanceProvider>,
    rng: Mutex<StdRng>,
}
impl JumphostSelector {
    pub fn new(provider: Arc<dyn InstanceProvider>) -> Self {
        Self::with_rng(provider, StdRng::from_entropy())
    }
    pub fn with_rng(provider: Arc<dyn InstanceProvider>, rng: StdRng) -> Self {
        JumphostSelector {
            provider,
            rng: Mutex::new(rng),
        }
    }
    pub async fn select_jumphost(
        &self,
        environment: &str,
        filter_template: &str,
        placeholder: &str,
    ) -> Result<Jumphost, TunnelError> {
        let filter = substitute_placeholder(filter_template, placeholder, environment);
        debug!("looking for jumphost with filter: {filter}");
        let mut instances: Vec<Instance> = self
            .provider
            .describe_running_instances_by_name_filter(&filter)
            .await
            .map_err(TunnelError::InstanceQuery)?
            .into_iter()
            .filter(|i| i.state == "running")
            .collect();
        if instances.is_empty() {
            return Err(TunnelError::NoHealthyJumphost(filter));
        }
        debug!("{} candidate jumphosts", instances.len());
        let index = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..instances.len());
        Ok(instances.swap_remove(index).into())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cloud::{CloudError, MockInstanceProvider};
    use mockall::predicate::*;

    fn instance(id: &str, name: Option<&str>, state: &str) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.map(String::from),
            private_ip: Some(String::from("10.0.0.1")),
            state: state.to_string(),
        }
    }

    fn selector(provider: MockInstanceProvider, seed: u64) -> JumphostSelector {
        JumphostSelector::with_rng(Arc::new(provider), StdRng::seed_from_u64(seed))
    }

    #[tokio::test]
    async fn filter_gets_the_environment() {
        let mut mock_provider = MockInstanceProvider::new();
        mock_provider
            .expect_describe_running_instances_by_name_filter()
            .with(eq("staging-autoscaled"))
            .times(1)
            .returning(|_| Ok(vec![instance("i-1", Some("staging-autoscaled"), "running")]));

        let jumphost = selector(mock_provider, 1)
            .select_jumphost("staging", "${PLACEHOLDER}-autoscaled", "${PLACEHOLDER}")
            .await
            .unwrap();
        assert_eq!(
            jumphost,
            Jumphost {
                id: String::from("i-1"),
                name: String::from("staging-autoscaled"),
                address: Some(String::from("10.0.0.1")),
            }
        );
    }

    #[tokio::test]
    async fn no_instances_means_no_jumphost() {
        let mut mock_provider = MockInstanceProvider::new();
        mock_provider
            .expect_describe_running_instances_by_name_filter()
            .times(1)
            .returning(|_| Ok(vec![instance("i-1", None, "stopped")]));

        let result = selector(mock_provider, 1)
            .select_jumphost("dev", "${PLACEHOLDER}-bastion", "${PLACEHOLDER}")
            .await;
        assert!(matches!(
            result,
            Err(TunnelError::NoHealthyJumphost(filter)) if filter == "dev-bastion"
        ));
    }

    #[tokio::test]
    async fn provider_failure_is_propagated() {
        let mut mock_provider = MockInstanceProvider::new();
        mock_provider
            .expect_describe_running_instances_by_name_filter()
            .times(1)
            .returning(|_| {
                Err(CloudError::Request {
                    operation: "DescribeInstances",
                    message: String::from("expired token"),
                })
            });

        let result = selector(mock_provider, 1)
            .select_jumphost("dev", "bastion", "${PLACEHOLDER}")
            .await;
        assert!(matches!(result, Err(TunnelError::InstanceQuery(_))));
    }

    #[tokio::test]
    async fn unnamed_instances_get_a_default_name() {
        let mut mock_provider = MockInstanceProvider::new();
        mock_provider
            .expect_describe_running_instances_by_name_filter()
            .returning(|_| Ok(vec![instance("i-9", None, "running")]));

        let jumphost = selector(mock_provider, 3)
            .select_jumphost("dev", "bastion", "${PLACEHOLDER}")
            .await
            .unwrap();
        assert_eq!(jumphost.name, "unnamed");
    }

    #[tokio::test]
    async fn selection_is_seeded_and_spread() {
        let candidates = || -> Result<Vec<Instance>, CloudError> {
            Ok(vec![
                instance("i-1", None, "running"),
                instance("i-2", None, "running"),
                instance("i-3", None, "running"),
            ])
        };
        let mut first_provider = MockInstanceProvider::new();
        first_provider
            .expect_describe_running_instances_by_name_filter()
            .returning(move |_| candidates());
        let mut second_provider = MockInstanceProvider::new();
        second_provider
            .expect_describe_running_instances_by_name_filter()
            .returning(move |_| candidates());
        let first = selector(first_provider, 42);
        let second = selector(second_provider, 42);

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let a = first.select_jumphost("dev", "bastion", "x").await.unwrap();
            let b = second.select_jumphost("dev", "bastion", "x").await.unwrap();
            assert_eq!(a, b);
            seen.insert(a.id);
        }
        assert_eq!(seen.len(), 3);
    }
}
