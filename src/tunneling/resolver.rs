use std::sync::Arc;

use tracing::debug;

use crate::{cloud::ParameterStore, config::ConfigValue};

use super::tunnel::TunnelError;

/// Replaces every occurrence of `placeholder` in `template` with `environment`.
pub fn substitute_placeholder(template: &str, placeholder: &str, environment: &str) -> String {
    if placeholder.is_empty() {
        return template.to_string();
    }
    template.replace(placeholder, environment)
}

/// Turns [`ConfigValue`]s into plain strings, going to the parameter store only for
/// `ssm_param` values. Nothing is cached.
pub(crate) struct ValueResolver {
    store: Arc<dyn ParameterStore>,
    placeholder: String,
    environment: String,
}
impl ValueResolver {
    pub fn new(store: Arc<dyn ParameterStore>, placeholder: &str, environment: &str) -> Self {
        ValueResolver {
            store,
            placeholder: placeholder.to_string(),
            environment: environment.to_string(),
        }
    }
    pub fn environment(&self) -> &str {
        &self.environment
    }
    pub fn store(&self) -> &dyn ParameterStore {
        self.store.as_ref()
    }
    pub fn substitute(&self, template: &str) -> String {
        substitute_placeholder(template, &self.placeholder, &self.environment)
    }
    pub async fn resolve(&self, value: &ConfigValue) -> Result<String, TunnelError> {
        match value {
            ConfigValue {
                value: Some(_),
                ssm_param: Some(_),
            } => Err(TunnelError::ConflictingSource),
            ConfigValue {
                value: None,
                ssm_param: None,
            } => Err(TunnelError::MissingSource),
            ConfigValue {
                value: Some(literal),
                ssm_param: None,
            } => Ok(literal.clone()),
            ConfigValue {
                value: None,
                ssm_param: Some(template),
            } => {
                let path = self.substitute(template);
                debug!("fetching parameter {path}");
                self.store
                    .get_parameter(&path)
                    .await
                    .map_err(|source| TunnelError::ResolutionFailed {
                        path,
                        environment: self.environment.clone(),
                        source,
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudError, MockParameterStore};
    use mockall::predicate::*;

    const PLACEHOLDER: &str = "${PLACEHOLDER}";

    fn resolver(mock_store: MockParameterStore) -> ValueResolver {
        ValueResolver::new(Arc::new(mock_store), PLACEHOLDER, "prod")
    }

    #[test]
    fn placeholder_substitution() {
        assert_eq!(
            substitute_placeholder("/${PLACEHOLDER}/a/${PLACEHOLDER}", PLACEHOLDER, "dev"),
            "/dev/a/dev"
        );
        assert_eq!(
            substitute_placeholder("no-token", PLACEHOLDER, "dev"),
            "no-token"
        );
        assert_eq!(substitute_placeholder("keep", "", "dev"), "keep");
    }

    #[tokio::test]
    async fn literal_never_touches_the_store() {
        let mut mock_store = MockParameterStore::new();
        mock_store.expect_get_parameter().never();
        let resolver = resolver(mock_store);

        let resolved = resolver
            .resolve(&ConfigValue::literal("db.internal:${PLACEHOLDER}"))
            .await;
        assert_eq!(resolved.unwrap(), "db.internal:${PLACEHOLDER}");
    }

    #[tokio::test]
    async fn both_sources_conflict() {
        let mut mock_store = MockParameterStore::new();
        mock_store.expect_get_parameter().never();
        let resolver = resolver(mock_store);

        let value = ConfigValue {
            value: Some(String::from("a")),
            ssm_param: Some(String::from("/b")),
        };
        let result = resolver.resolve(&value).await;
        assert!(matches!(result, Err(TunnelError::ConflictingSource)));
    }

    #[tokio::test]
    async fn no_source_is_missing() {
        let mut mock_store = MockParameterStore::new();
        mock_store.expect_get_parameter().never();
        let resolver = resolver(mock_store);

        let result = resolver.resolve(&ConfigValue::default()).await;
        assert!(matches!(result, Err(TunnelError::MissingSource)));
    }

    #[tokio::test]
    async fn parameter_path_gets_the_environment() {
        let mut mock_store = MockParameterStore::new();
        mock_store
            .expect_get_parameter()
            .with(eq("/prod/service/prod/host"))
            .times(1)
            .returning(|_| Ok(String::from("db.prod.internal")));
        let resolver = resolver(mock_store);

        let resolved = resolver
            .resolve(&ConfigValue::parameter(
                "/${PLACEHOLDER}/service/${PLACEHOLDER}/host",
            ))
            .await;
        assert_eq!(resolved.unwrap(), "db.prod.internal");
    }

    #[tokio::test]
    async fn store_failure_keeps_the_context() {
        let mut mock_store = MockParameterStore::new();
        mock_store
            .expect_get_parameter()
            .with(eq("/prod/host"))
            .times(1)
            .returning(|_| Err(CloudError::Timeout {
                operation: "GetParameter",
            }));
        let resolver = resolver(mock_store);

        let result = resolver
            .resolve(&ConfigValue::parameter("/${PLACEHOLDER}/host"))
            .await;
        match result {
            Err(TunnelError::ResolutionFailed {
                path, environment, ..
            }) => {
                assert_eq!(path, "/prod/host");
                assert_eq!(environment, "prod");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
