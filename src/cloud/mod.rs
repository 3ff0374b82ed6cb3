use async_trait::async_trait;
use futures::future::try_join_all;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub(crate) mod aws;

/// the parameter store refuses more names than this in a single call
pub const MAX_PARAMETERS_PER_CALL: usize = 10;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("parameter {0} has no value")]
    MissingValue(String),
    #[error("no parameters found")]
    NoParametersFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Parameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Instance {
    pub id: String,
    /// value of the `Name` tag
    pub name: Option<String>,
    pub private_ip: Option<String>,
    pub state: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, name: &str) -> Result<String, CloudError>;
    /// a single underlying call, `names` holds at most [`MAX_PARAMETERS_PER_CALL`] entries
    async fn get_parameters(&self, names: &[String]) -> Result<Vec<Parameter>, CloudError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait InstanceProvider: Send + Sync {
    async fn describe_running_instances_by_name_filter(
        &self,
        filter: &str,
    ) -> Result<Vec<Instance>, CloudError>;
}

/// Fetches `paths` in batches the store accepts and concatenates the results in order.
pub(crate) async fn get_parameters_by_batch_of_paths(
    store: &dyn ParameterStore,
    paths: &[String],
) -> Result<Vec<Parameter>, CloudError> {
    let batches = paths.chunks(MAX_PARAMETERS_PER_CALL).map(|batch| {
        debug!("fetching batch of {} parameters", batch.len());
        store.get_parameters(batch)
    });
    let parameters: Vec<Parameter> = try_join_all(batches).await?.into_iter().flatten().collect();
    if parameters.is_empty() {
        return Err(CloudError::NoParametersFound);
    }
    debug!("found a total of {} parameters", parameters.len());
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    fn paths(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("/test/param/{i}")).collect()
    }

    #[tokio::test]
    async fn batches_of_ten() {
        let mut mock_store = MockParameterStore::new();
        mock_store
            .expect_get_parameters()
            .withf(|names| names.len() <= MAX_PARAMETERS_PER_CALL)
            .times(3)
            .returning(|names| {
                Ok(names
                    .iter()
                    .map(|n| Parameter {
                        name: n.clone(),
                        value: format!("value of {n}"),
                    })
                    .collect())
            });

        let requested = paths(23);
        let parameters = get_parameters_by_batch_of_paths(&mock_store, &requested)
            .await
            .unwrap();
        assert_eq!(parameters.len(), 23);
        let names: Vec<String> = parameters.into_iter().map(|p| p.name).collect();
        assert_eq!(names, requested);
    }

    #[tokio::test]
    async fn empty_result_is_an_error() {
        let mut mock_store = MockParameterStore::new();
        mock_store
            .expect_get_parameters()
            .times(1)
            .returning(|_| Ok(vec![]));

        let result = get_parameters_by_batch_of_paths(&mock_store, &paths(2)).await;
        assert!(matches!(result, Err(CloudError::NoParametersFound)));
    }

    #[tokio::test]
    async fn no_paths_means_no_calls() {
        let mut mock_store = MockParameterStore::new();
        mock_store.expect_get_parameters().never();

        let result = get_parameters_by_batch_of_paths(&mock_store, &[]).await;
        assert!(matches!(result, Err(CloudError::NoParametersFound)));
    }

    #[tokio::test]
    async fn batch_failure_is_propagated() {
        let mut mock_store = MockParameterStore::new();
        mock_store
            .expect_get_parameters()
            .with(eq(vec![String::from("/test/param/0")]))
            .times(1)
            .returning(|_| {
                Err(CloudError::Request {
                    operation: "GetParameters",
                    message: String::from("access denied"),
                })
            });

        let result = get_parameters_by_batch_of_paths(&mock_store, &paths(1)).await;
        assert!(matches!(result, Err(CloudError::Request { .. })));
    }
}
