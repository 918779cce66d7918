use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta, Utc};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{Retryable, RetryableStrategy};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time;

use crate::{
    config::{ControlPlaneConfig, BUNDLER_ENV_VARS, DEFAULT_DOMAIN_SUFFIX, DEFAULT_SERVICE_NAME},
    models::{split_container_id, RemoteMetadata, SandboxStatus},
    store::{KeyValueStore, MemoryStore},
    FleetError, FleetResult, RemoteError,
};

use super::{
    graphql::*, map_deployment_status, map_log_severity, retry_after, ContainerConfig,
    ContainerStatus, ControlPlane, ControlPlaneRetryStrategy, CreatedContainer, LogEntry,
    LogPage, LogQuery, RetryPolicy,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Logs fetched when the caller does not ask for a specific amount.
const DEFAULT_LOG_LIMIT: u32 = 100;

/// The longest slice of an error body kept in an error message.
const MAX_ERROR_BODY_LEN: usize = 512;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`ControlPlane`] backed by a GraphQL control-plane API.
///
/// Every call goes through the same retry loop: transient failures (5xx, 429 and network
/// errors) are retried with exponential backoff up to [`RetryPolicy::max_retries`] extra times,
/// and a 429 carrying `Retry-After` waits for the advertised delay instead.
///
/// The identifiers behind a container id are cached in a [`KeyValueStore`]. A miss, e.g. after
/// a process restart, is resolved by asking the control plane again.
pub struct RemoteControlClient {
    client: ClientWithMiddleware,
    endpoint: String,
    api_token: String,
    bundler_image: String,
    policy: RetryPolicy,
    metadata: Arc<dyn KeyValueStore<RemoteMetadata>>,
}

/// A failed attempt, with the delay the server asked for.
struct FailedAttempt {
    error: FleetError,
    retry_after: Option<Duration>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RemoteControlClient {
    /// Creates a client that keeps container metadata in memory.
    pub fn new(config: &ControlPlaneConfig) -> FleetResult<Self> {
        Self::with_metadata_store(config, MemoryStore::shared())
    }

    /// Creates a client that keeps container metadata in `metadata`.
    pub fn with_metadata_store(
        config: &ControlPlaneConfig,
        metadata: Arc<dyn KeyValueStore<RemoteMetadata>>,
    ) -> FleetResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FleetError::Config(format!("cannot build http client: {e}")))?;

        // No retry middleware: `execute` retries itself so it can honor `Retry-After` and
        // GraphQL error bodies, and `send` classifies attempts with the same strategy.
        Ok(Self {
            client: ClientBuilder::new(http).build(),
            endpoint: config.get_endpoint().clone(),
            api_token: config.get_api_token().clone(),
            bundler_image: config.get_bundler_image().clone(),
            policy: RetryPolicy::from_config(config),
            metadata,
        })
    }

    /// The retry policy applied to every call.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs one GraphQL operation, retrying transient failures.
    async fn execute<T>(
        &self,
        operation: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> FleetResult<T>
    where
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(&GraphQlRequest { query, variables })?;
        let mut attempt = 0;

        loop {
            let failure = match self.send(operation, &body).await {
                Ok(data) => return Ok(data),
                Err(failure) => failure,
            };

            if !failure.error.is_retryable() || attempt >= self.policy.max_retries {
                return Err(failure.error);
            }

            let delay = failure
                .retry_after
                .unwrap_or_else(|| self.policy.backoff(attempt));

            tracing::warn!(
                operation,
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "control plane call failed, retrying"
            );

            time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Makes a single attempt at an operation.
    async fn send<T>(&self, operation: &str, body: &[u8]) -> Result<T, FailedAttempt>
    where
        T: DeserializeOwned,
    {
        let result = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await;

        let classification = ControlPlaneRetryStrategy.handle(&result);
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let retryable = !matches!(classification, Some(Retryable::Fatal));
                return Err(FailedAttempt::new(RemoteError {
                    message: format!("{operation} request failed: {e}"),
                    status_code: None,
                    retryable,
                }));
            }
        };

        let status = response.status();
        if let Some(kind) = classification {
            let retry_after = (status == StatusCode::TOO_MANY_REQUESTS)
                .then(|| retry_after(&response))
                .flatten();
            let text = response.text().await.unwrap_or_default();

            return Err(FailedAttempt {
                error: RemoteError {
                    message: format!("{operation} failed with {status}: {}", truncate(&text)),
                    status_code: Some(status.as_u16()),
                    retryable: matches!(kind, Retryable::Transient),
                }
                .into(),
                retry_after,
            });
        }

        let text = response.text().await.map_err(|e| {
            FailedAttempt::new(RemoteError::transient(
                format!("{operation} response could not be read: {e}"),
                Some(status.as_u16()),
            ))
        })?;

        let envelope: GraphQlResponse<T> = serde_json::from_str(&text).map_err(|e| {
            FailedAttempt::new(RemoteError::permanent(
                format!("{operation} returned a malformed response: {e}"),
                Some(status.as_u16()),
            ))
        })?;

        if !envelope.errors.is_empty() {
            let message = envelope
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");

            let error = if message.to_ascii_lowercase().contains("not found") {
                FleetError::NotFound(format!("{operation}: {message}"))
            } else {
                RemoteError::permanent(format!("{operation}: {message}"), Some(status.as_u16()))
                    .into()
            };

            return Err(FailedAttempt {
                error,
                retry_after: None,
            });
        }

        envelope.data.ok_or_else(|| {
            FailedAttempt::new(RemoteError::permanent(
                format!("{operation} returned no data"),
                Some(status.as_u16()),
            ))
        })
    }

    /// The identifiers behind `container_id`, asking the control plane on a cache miss.
    ///
    /// Returns `None` when the container is unknown to the control plane.
    async fn resolve_metadata(&self, container_id: &str) -> FleetResult<Option<RemoteMetadata>> {
        if let Some(metadata) = self.metadata.get(container_id).await {
            return Ok(Some(metadata));
        }

        let Ok((project_id, service_id)) = split_container_id(container_id) else {
            return Ok(None);
        };

        let project: ProjectData = match self
            .execute("project", PROJECT_ENVIRONMENTS, json!({ "id": project_id }))
            .await
        {
            Ok(data) => data,
            Err(FleetError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(environment_id) = project
            .project
            .and_then(|p| p.environments.edges.into_iter().next())
            .map(|edge| edge.node.id)
        else {
            return Ok(None);
        };

        let deployment = self.latest_deployment(service_id, &environment_id).await?;
        let metadata = RemoteMetadata {
            project_id: project_id.to_string(),
            service_id: service_id.to_string(),
            environment_id,
            deployment_id: deployment.map(|d| d.id),
        };

        tracing::debug!(container_id, "re-derived container metadata");
        self.metadata.set(container_id, metadata.clone()).await;

        Ok(Some(metadata))
    }

    async fn latest_deployment(
        &self,
        service_id: &str,
        environment_id: &str,
    ) -> FleetResult<Option<Deployment>> {
        let data: ServiceInstanceData = match self
            .execute(
                "serviceInstance",
                LATEST_DEPLOYMENT,
                json!({ "serviceId": service_id, "environmentId": environment_id }),
            )
            .await
        {
            Ok(data) => data,
            Err(FleetError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(data.service_instance.and_then(|s| s.latest_deployment))
    }

    /// Finds the public domain of a service, creating one when it has none.
    async fn find_or_create_domain(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> FleetResult<String> {
        let existing: DomainsData = self
            .execute(
                "domains",
                DOMAINS,
                json!({
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                }),
            )
            .await?;

        let Domains {
            service_domains,
            custom_domains,
        } = existing.domains;
        if let Some(domain) = service_domains.into_iter().chain(custom_domains).next() {
            return Ok(domain.domain);
        }

        let created: DomainCreateData = self
            .execute(
                "serviceDomainCreate",
                SERVICE_DOMAIN_CREATE,
                json!({ "input": { "environmentId": environment_id, "serviceId": service_id } }),
            )
            .await?;

        Ok(created.service_domain_create.domain)
    }
}

impl FailedAttempt {
    fn new(error: impl Into<FleetError>) -> Self {
        Self {
            error: error.into(),
            retry_after: None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ControlPlane for RemoteControlClient {
    async fn create_container(&self, config: &ContainerConfig) -> FleetResult<CreatedContainer> {
        let project_name = config
            .project_name
            .clone()
            .unwrap_or_else(|| format!("metro-{}", config.task_id));

        tracing::info!(task_id = %config.task_id, %project_name, "creating container");

        let created: ProjectCreateData = self
            .execute(
                "projectCreate",
                PROJECT_CREATE,
                json!({ "input": { "name": project_name } }),
            )
            .await?;
        let project_id = created.project_create.id;
        let environment_id = created
            .project_create
            .environments
            .edges
            .into_iter()
            .next()
            .map(|edge| edge.node.id)
            .ok_or_else(|| {
                RemoteError::permanent(format!("project {project_id} has no environment"), None)
            })?;

        let service: ServiceCreateData = self
            .execute(
                "serviceCreate",
                SERVICE_CREATE,
                json!({
                    "input": {
                        "projectId": project_id,
                        "name": DEFAULT_SERVICE_NAME,
                        "source": { "image": self.bundler_image },
                    }
                }),
            )
            .await?;
        let service_id = service.service_create.id;

        let required = BUNDLER_ENV_VARS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()));
        let extra = config
            .env_vars
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()));
        for (name, value) in required.chain(extra) {
            let _: Ignored = self
                .execute(
                    "variableUpsert",
                    VARIABLE_UPSERT,
                    json!({
                        "input": {
                            "projectId": project_id,
                            "environmentId": environment_id,
                            "serviceId": service_id,
                            "name": name,
                            "value": value,
                        }
                    }),
                )
                .await?;
        }

        let deploy: DeployData = self
            .execute(
                "serviceInstanceDeployV2",
                SERVICE_INSTANCE_DEPLOY,
                json!({ "serviceId": service_id, "environmentId": environment_id }),
            )
            .await?;

        let domain = match self
            .find_or_create_domain(&project_id, &environment_id, &service_id)
            .await
        {
            Ok(domain) => domain,
            Err(e) => {
                let fallback = fallback_domain(&project_name);
                tracing::warn!(error = %e, %fallback, "could not resolve public domain");
                fallback
            }
        };

        let metadata = RemoteMetadata {
            project_id: project_id.clone(),
            service_id: service_id.clone(),
            environment_id,
            deployment_id: Some(deploy.service_instance_deploy_v2),
        };
        let container_id = metadata.container_id();
        self.metadata.set(&container_id, metadata).await;

        let metro_url = format!("https://{domain}");
        tracing::info!(%container_id, %metro_url, "container created");

        Ok(CreatedContainer {
            container_id,
            metro_url,
            project_id,
            service_id,
        })
    }

    async fn start_container(&self, container_id: &str) -> FleetResult<SandboxStatus> {
        let metadata = self
            .resolve_metadata(container_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("container {container_id}")))?;

        let _: Ignored = self
            .execute(
                "serviceInstanceRedeploy",
                SERVICE_INSTANCE_REDEPLOY,
                json!({
                    "serviceId": metadata.service_id,
                    "environmentId": metadata.environment_id,
                }),
            )
            .await?;

        tracing::info!(container_id, "container redeploy triggered");
        Ok(SandboxStatus::Starting)
    }

    async fn stop_container(&self, container_id: &str) -> FleetResult<SandboxStatus> {
        let (_, service_id) = split_container_id(container_id)?;

        match self
            .execute::<Ignored>("serviceDelete", SERVICE_DELETE, json!({ "id": service_id }))
            .await
        {
            Ok(_) => tracing::info!(container_id, "container stopped"),
            Err(e) if is_gone(&e) => {
                tracing::debug!(container_id, "service already gone");
            }
            Err(e) => return Err(e),
        }

        Ok(SandboxStatus::Stopped)
    }

    async fn delete_container(&self, container_id: &str) -> FleetResult<bool> {
        let (project_id, _) = split_container_id(container_id)?;

        match self
            .execute::<Ignored>("projectDelete", PROJECT_DELETE, json!({ "id": project_id }))
            .await
        {
            Ok(_) => tracing::info!(container_id, "container deleted"),
            Err(e) if is_gone(&e) => {
                tracing::debug!(container_id, "project already gone");
            }
            Err(e) => return Err(e),
        }

        self.metadata.delete(container_id).await;
        Ok(true)
    }

    async fn get_container_status(&self, container_id: &str) -> FleetResult<ContainerStatus> {
        let stopped = ContainerStatus {
            status: SandboxStatus::Stopped,
            resource_usage: None,
            uptime_seconds: None,
        };

        let Some(metadata) = self.resolve_metadata(container_id).await? else {
            return Ok(stopped);
        };

        let Some(deployment) = self
            .latest_deployment(&metadata.service_id, &metadata.environment_id)
            .await?
        else {
            return Ok(stopped);
        };

        let status = map_deployment_status(&deployment.status);
        let uptime_seconds = match (status, deployment.created_at) {
            (SandboxStatus::Running, Some(created_at)) => {
                Some((Utc::now() - created_at).num_seconds().max(0) as u64)
            }
            _ => None,
        };

        if metadata.deployment_id.as_deref() != Some(deployment.id.as_str()) {
            self.metadata
                .set(
                    container_id,
                    RemoteMetadata {
                        deployment_id: Some(deployment.id),
                        ..metadata
                    },
                )
                .await;
        }

        Ok(ContainerStatus {
            status,
            resource_usage: None,
            uptime_seconds,
        })
    }

    async fn get_container_logs(
        &self,
        container_id: &str,
        query: &LogQuery,
    ) -> FleetResult<LogPage> {
        let Some(metadata) = self.resolve_metadata(container_id).await? else {
            return Ok(LogPage::default());
        };

        let latest = self
            .latest_deployment(&metadata.service_id, &metadata.environment_id)
            .await?
            .map(|d| d.id);
        let Some(deployment_id) = latest.or(metadata.deployment_id) else {
            return Ok(LogPage::default());
        };

        let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
        let data: DeploymentLogsData = self
            .execute(
                "deploymentLogs",
                DEPLOYMENT_LOGS,
                json!({
                    "deploymentId": deployment_id,
                    "limit": limit,
                    "startDate": query.cursor,
                }),
            )
            .await?;

        let logs: Vec<LogEntry> = data
            .deployment_logs
            .into_iter()
            .map(|log| LogEntry {
                timestamp: log.timestamp,
                message: log.message,
                severity: map_log_severity(log.severity.as_deref()),
            })
            .collect();

        Ok(LogPage {
            has_more: logs.len() as u64 >= u64::from(limit) && limit > 0,
            // Resume just past the last line so it is not returned again.
            cursor: logs.last().map(|log| {
                (log.timestamp + TimeDelta::milliseconds(1))
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
            }),
            logs,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The domain assumed when none can be resolved: the project name made DNS safe.
fn fallback_domain(project_name: &str) -> String {
    let label = project_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();

    format!("{}.{DEFAULT_DOMAIN_SUFFIX}", label.trim_matches('-'))
}

fn is_gone(error: &FleetError) -> bool {
    matches!(error, FleetError::NotFound(_)) || error.status_code() == Some(404)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_ERROR_BODY_LEN) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use mockito::{Matcher, Server};

    use super::*;
    use crate::remote::LogSeverity;

    fn client(server: &Server, max_retries: u32) -> RemoteControlClient {
        let config = ControlPlaneConfig::builder()
            .endpoint(server.url())
            .api_token("test-token")
            .max_retries(max_retries)
            .base_delay_ms(1)
            .max_delay_ms(5)
            .build();

        RemoteControlClient::new(&config).unwrap()
    }

    #[test]
    fn test_fallback_domain_is_dns_safe() {
        assert_eq!(fallback_domain("metro-task_1"), "metro-task-1.up.railway.app");
        assert_eq!(fallback_domain("My App!"), "my-app.up.railway.app");
    }

    #[test_log::test(tokio::test)]
    async fn test_server_errors_are_retried_up_to_max_retries() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(503)
            .with_body("upstream unavailable")
            .expect(4)
            .create_async()
            .await;

        let err = client(&server, 3)
            .stop_container("p1:s1")
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.status_code(), Some(503));
        mock.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unreachable_endpoint_is_retryable_without_status() -> anyhow::Result<()> {
        // Nothing listens on a port freed right after binding it.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
        let config = ControlPlaneConfig::builder()
            .endpoint(format!("http://{addr}"))
            .api_token("test-token")
            .max_retries(2)
            .base_delay_ms(1)
            .max_delay_ms(5)
            .build();
        let client = RemoteControlClient::new(&config)?;

        let err = client
            .execute::<serde_json::Value>("projects", "query { projects { id } }", json!({}))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.status_code(), None);
        assert!(err.to_string().contains("projects request failed"), "{err}");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_client_errors_are_not_retried() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(401)
            .with_body("unauthorized")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server, 3)
            .stop_container("p1:s1")
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), Some(401));
        mock.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rate_limit_honors_retry_after() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(429)
            .with_header("retry-after", "1")
            .expect(2)
            .create_async()
            .await;

        let started = Instant::now();
        let err = client(&server, 1)
            .stop_container("p1:s1")
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(err.status_code(), Some(429));
        mock.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_graphql_errors_fail_a_successful_response() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"data":null,"errors":[{"message":"Not Authorized"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server, 3)
            .stop_container("p1:s1")
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::Remote(ref e) if !e.retryable));
        mock.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_stop_and_delete_are_idempotent() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"data":null,"errors":[{"message":"Service not found"}]}"#)
            .create_async()
            .await;

        let client = client(&server, 3);
        assert_eq!(
            client.stop_container("p1:s1").await?,
            SandboxStatus::Stopped
        );
        assert!(client.delete_container("p1:s1").await?);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_start_unknown_container_is_not_found() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query project".into()))
            .with_status(200)
            .with_body(r#"{"data":{"project":null}}"#)
            .create_async()
            .await;

        let err = client(&server, 0)
            .start_container("p1:s1")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_create_container_then_query_status() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let project = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::Regex("mutation projectCreate".into()))
            .with_body(
                r#"{"data":{"projectCreate":{"id":"p1","name":"metro-task-1",
                   "environments":{"edges":[{"node":{"id":"e1","name":"production"}}]}}}}"#,
            )
            .expect(1)
            .create_async()
            .await;
        let service = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation serviceCreate".into()))
            .with_body(r#"{"data":{"serviceCreate":{"id":"s1","name":"metro"}}}"#)
            .expect(1)
            .create_async()
            .await;
        let variables = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation variableUpsert".into()))
            .with_body(r#"{"data":{"variableUpsert":true}}"#)
            .expect(3)
            .create_async()
            .await;
        let deploy = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation serviceInstanceDeployV2".into()))
            .with_body(r#"{"data":{"serviceInstanceDeployV2":"d1"}}"#)
            .expect(1)
            .create_async()
            .await;
        let domains = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query domains".into()))
            .with_body(
                r#"{"data":{"domains":{"serviceDomains":[{"domain":"metro-task-1.up.railway.app"}],
                   "customDomains":[]}}}"#,
            )
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query serviceInstance".into()))
            .with_body(
                r#"{"data":{"serviceInstance":{"latestDeployment":
                   {"id":"d1","status":"SUCCESS","createdAt":"2024-01-01T00:00:00Z"}}}}"#,
            )
            .create_async()
            .await;

        let client = client(&server, 0);
        let created = client
            .create_container(&ContainerConfig {
                task_id: "task-1".into(),
                user_id: "user-1".into(),
                project_name: None,
                env_vars: [("EXPO_PUBLIC_TASK".to_string(), "task-1".to_string())].into(),
            })
            .await?;

        assert_eq!(created.container_id, "p1:s1");
        assert_eq!(created.project_id, "p1");
        assert_eq!(created.service_id, "s1");
        assert_eq!(created.metro_url, "https://metro-task-1.up.railway.app");

        project.assert_async().await;
        service.assert_async().await;
        variables.assert_async().await;
        deploy.assert_async().await;
        domains.assert_async().await;

        let status = client.get_container_status(&created.container_id).await?;
        assert_eq!(status.status, SandboxStatus::Running);
        assert!(status.uptime_seconds.unwrap_or(0) > 0);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_domain_resolution_falls_back_to_project_name() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation projectCreate".into()))
            .with_body(
                r#"{"data":{"projectCreate":{"id":"p2",
                   "environments":{"edges":[{"node":{"id":"e2"}}]}}}}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation serviceCreate".into()))
            .with_body(r#"{"data":{"serviceCreate":{"id":"s2"}}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation variableUpsert".into()))
            .with_body(r#"{"data":{"variableUpsert":true}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation serviceInstanceDeployV2".into()))
            .with_body(r#"{"data":{"serviceInstanceDeployV2":"d2"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query domains".into()))
            .with_body(r#"{"data":{"domains":{"serviceDomains":[],"customDomains":[]}}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("mutation serviceDomainCreate".into()))
            .with_body(r#"{"data":null,"errors":[{"message":"Domain limit reached"}]}"#)
            .create_async()
            .await;

        let created = client(&server, 0)
            .create_container(&ContainerConfig {
                task_id: "task-2".into(),
                user_id: "user-1".into(),
                project_name: Some("Preview Task 2".into()),
                env_vars: Default::default(),
            })
            .await?;

        assert_eq!(created.container_id, "p2:s2");
        assert_eq!(created.metro_url, "https://preview-task-2.up.railway.app");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_metadata_is_rederived_after_restart() -> anyhow::Result<()> {
        let mut server = Server::new_async().await;
        let project = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query project".into()))
            .with_body(
                r#"{"data":{"project":{"id":"p1",
                   "environments":{"edges":[{"node":{"id":"e1","name":"production"}}]}}}}"#,
            )
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query serviceInstance".into()))
            .with_body(
                r#"{"data":{"serviceInstance":{"latestDeployment":
                   {"id":"d1","status":"BUILDING","createdAt":"2024-01-01T00:00:00Z"}}}}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::Regex("query deploymentLogs".into()))
            .with_body(
                r#"{"data":{"deploymentLogs":[
                   {"message":"Starting Metro Bundler","timestamp":"2024-01-01T00:00:01Z","severity":"info"},
                   {"message":"error: SyntaxError in App.tsx","timestamp":"2024-01-01T00:00:02Z","severity":"error"}
                ]}}"#,
            )
            .create_async()
            .await;

        let client = client(&server, 0);

        let status = client.get_container_status("p1:s1").await?;
        assert_eq!(status.status, SandboxStatus::Starting);
        assert_eq!(status.uptime_seconds, None);

        let page = client
            .get_container_logs(
                "p1:s1",
                &LogQuery {
                    limit: Some(2),
                    cursor: None,
                },
            )
            .await?;
        assert_eq!(page.logs.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.logs[1].severity, LogSeverity::Error);
        assert_eq!(
            page.cursor.as_deref(),
            Some("2024-01-01T00:00:02.001Z")
        );

        // The project lookup is cached after the first miss.
        project.assert_async().await;

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_container_reports_stopped() -> anyhow::Result<()> {
        let server = Server::new_async().await;
        let client = client(&server, 0);

        let status = client.get_container_status("malformed").await?;
        assert_eq!(status.status, SandboxStatus::Stopped);

        let page = client
            .get_container_logs("malformed", &LogQuery::default())
            .await?;
        assert!(page.logs.is_empty());
        assert!(!page.has_more);

        Ok(())
    }
}
