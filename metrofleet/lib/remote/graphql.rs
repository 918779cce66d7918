//! Wire types for the control-plane GraphQL API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants: Mutations
//--------------------------------------------------------------------------------------------------

pub(super) const PROJECT_CREATE: &str = r#"
mutation projectCreate($input: ProjectCreateInput!) {
  projectCreate(input: $input) {
    id
    name
    environments { edges { node { id name } } }
  }
}"#;

pub(super) const SERVICE_CREATE: &str = r#"
mutation serviceCreate($input: ServiceCreateInput!) {
  serviceCreate(input: $input) { id name }
}"#;

pub(super) const VARIABLE_UPSERT: &str = r#"
mutation variableUpsert($input: VariableUpsertInput!) {
  variableUpsert(input: $input)
}"#;

pub(super) const SERVICE_INSTANCE_DEPLOY: &str = r#"
mutation serviceInstanceDeployV2($serviceId: String!, $environmentId: String!) {
  serviceInstanceDeployV2(serviceId: $serviceId, environmentId: $environmentId)
}"#;

pub(super) const SERVICE_DOMAIN_CREATE: &str = r#"
mutation serviceDomainCreate($input: ServiceDomainCreateInput!) {
  serviceDomainCreate(input: $input) { domain }
}"#;

pub(super) const SERVICE_INSTANCE_REDEPLOY: &str = r#"
mutation serviceInstanceRedeploy($serviceId: String!, $environmentId: String!) {
  serviceInstanceRedeploy(serviceId: $serviceId, environmentId: $environmentId)
}"#;

pub(super) const SERVICE_DELETE: &str = r#"
mutation serviceDelete($id: String!) {
  serviceDelete(id: $id)
}"#;

pub(super) const PROJECT_DELETE: &str = r#"
mutation projectDelete($id: String!) {
  projectDelete(id: $id)
}"#;

//--------------------------------------------------------------------------------------------------
// Constants: Queries
//--------------------------------------------------------------------------------------------------

pub(super) const DOMAINS: &str = r#"
query domains($projectId: String!, $environmentId: String!, $serviceId: String!) {
  domains(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId) {
    serviceDomains { domain }
    customDomains { domain }
  }
}"#;

pub(super) const PROJECT_ENVIRONMENTS: &str = r#"
query project($id: String!) {
  project(id: $id) {
    id
    environments { edges { node { id name } } }
  }
}"#;

pub(super) const LATEST_DEPLOYMENT: &str = r#"
query serviceInstance($serviceId: String!, $environmentId: String!) {
  serviceInstance(serviceId: $serviceId, environmentId: $environmentId) {
    latestDeployment { id status createdAt }
  }
}"#;

pub(super) const DEPLOYMENT_LOGS: &str = r#"
query deploymentLogs($deploymentId: String!, $limit: Int, $startDate: DateTime) {
  deploymentLogs(deploymentId: $deploymentId, limit: $limit, startDate: $startDate) {
    message
    timestamp
    severity
  }
}"#;

//--------------------------------------------------------------------------------------------------
// Types: Envelope
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(super) struct GraphQlRequest<'a> {
    pub query: &'a str,
    pub variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(super) struct GraphQlResponse<T> {
    pub data: Option<T>,

    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub(super) struct GraphQlError {
    pub message: String,
}

//--------------------------------------------------------------------------------------------------
// Types: Payloads
//--------------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProjectCreateData {
    pub project_create: Project,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProjectData {
    pub project: Option<Project>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Project {
    pub id: String,

    #[serde(default)]
    pub environments: Connection<Environment>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Environment {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Connection<T> {
    pub edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Edge<T> {
    pub node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ServiceCreateData {
    pub service_create: Service,
}

#[derive(Debug, Deserialize)]
pub(super) struct Service {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeployData {
    pub service_instance_deploy_v2: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct DomainsData {
    pub domains: Domains,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Domains {
    #[serde(default)]
    pub service_domains: Vec<Domain>,

    #[serde(default)]
    pub custom_domains: Vec<Domain>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DomainCreateData {
    pub service_domain_create: Domain,
}

#[derive(Debug, Deserialize)]
pub(super) struct Domain {
    pub domain: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ServiceInstanceData {
    pub service_instance: Option<ServiceInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ServiceInstance {
    pub latest_deployment: Option<Deployment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Deployment {
    pub id: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeploymentLogsData {
    pub deployment_logs: Vec<RemoteLog>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RemoteLog {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Option<String>,
}

/// Mutations that only report success.
#[derive(Debug, Deserialize)]
pub(super) struct Ignored {}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self { edges: Vec::new() }
    }
}
