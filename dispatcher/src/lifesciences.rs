use async_trait::async_trait;
use common::{BatchRequest, Operation};
use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};

use crate::batch::BatchCompute;
use crate::error::Result;
use crate::gcp::{duration_string, GoogleApi};

const API: &str = "https://lifesciences.googleapis.com/v2beta";

/// Cloud Life Sciences `pipelines.run` / `operations.get`.
#[derive(Debug, Clone)]
pub struct LifeSciences {
    api: GoogleApi,
    parent: String,
}

/* ---- wire shapes ---- */

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunPipelineRequest<'a> {
    pipeline: Pipeline<'a>,
    pub_sub_topic: &'a str,
    labels: BTreeMap<&'static str, &'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pipeline<'a> {
    actions: Vec<Action<'a>>,
    resources: Resources<'a>,
    environment: &'a BTreeMap<String, String>,
    timeout: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Action<'a> {
    container_name: &'a str,
    image_uri: &'a str,
    commands: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Resources<'a> {
    zones: &'a [String],
    virtual_machine: VirtualMachine<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine<'a> {
    machine_type: &'a str,
    preemptible: bool,
    boot_disk_size_gb: u32,
    boot_image: &'a str,
    service_account: ServiceAccount<'a>,
    enable_stackdriver_monitoring: bool,
}

#[derive(Debug, Serialize)]
struct ServiceAccount<'a> {
    email: &'a str,
    scopes: &'a [String],
}

fn run_request(req: &BatchRequest) -> RunPipelineRequest<'_> {
    RunPipelineRequest {
        pipeline: Pipeline {
            actions: vec![Action {
                container_name: &req.container_name,
                image_uri: &req.image_uri,
                commands: &req.command,
            }],
            resources: Resources {
                zones: &req.zones,
                virtual_machine: VirtualMachine {
                    machine_type: &req.machine_type,
                    preemptible: req.preemptible,
                    boot_disk_size_gb: req.boot_disk_size_gb,
                    boot_image: &req.boot_image,
                    service_account: ServiceAccount {
                        email: &req.service_account.email,
                        scopes: &req.service_account.scopes,
                    },
                    enable_stackdriver_monitoring: req.enable_monitoring,
                },
            },
            environment: &req.environment,
            timeout: duration_string(Duration::from_secs(req.timeout_secs)),
        },
        pub_sub_topic: &req.pubsub_topic,
        labels: BTreeMap::from([("container", req.container_name.as_str())]),
    }
}

impl LifeSciences {
    pub fn new(api: GoogleApi, project_id: &str, region: &str) -> Self {
        Self {
            api,
            parent: format!("projects/{project_id}/locations/{region}"),
        }
    }
}

#[async_trait]
impl BatchCompute for LifeSciences {
    async fn submit(&self, req: &BatchRequest) -> Result<Operation> {
        let http = self
            .api
            .http()
            .post(format!("{}/{}/pipelines:run", API, self.parent))
            .json(&run_request(req));
        self.api
            .send_json(http, &format!("pipelines.run {}", req.container_name))
            .await
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        let http = self.api.http().get(format!("{}/{}", API, name));
        self.api.send_json(http, &format!("operation {name}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::pipeline::ServiceAccount as Sa;
    use serde_json::json;

    #[test]
    fn run_request_uses_provider_field_names() {
        let req = BatchRequest {
            image_uri: "docker.io/caendr/indel_primer:v2".into(),
            command: vec!["python".into(), "/indel_primer/main.py".into()],
            container_name: "indel-primer-j1".into(),
            environment: BTreeMap::from([("SPECIES".to_string(), "c_elegans".to_string())]),
            service_account: Sa {
                email: "sa@p.iam.gserviceaccount.com".into(),
                scopes: vec!["https://www.googleapis.com/auth/cloud-platform".into()],
            },
            machine_type: "n1-standard-1".into(),
            preemptible: false,
            boot_disk_size_gb: 20,
            boot_image: common::pipeline::BOOT_IMAGE.into(),
            zones: vec!["us-central1-a".into()],
            timeout_secs: 3600,
            pubsub_topic: "projects/p/topics/pipeline-status".into(),
            enable_monitoring: true,
        };
        let body = serde_json::to_value(run_request(&req)).unwrap();

        assert_eq!(body["pubSubTopic"], json!("projects/p/topics/pipeline-status"));
        assert_eq!(body["pipeline"]["timeout"], json!("3600s"));
        assert_eq!(body["pipeline"]["environment"]["SPECIES"], json!("c_elegans"));
        assert_eq!(body["pipeline"]["actions"][0]["imageUri"], json!("docker.io/caendr/indel_primer:v2"));
        let vm = &body["pipeline"]["resources"]["virtualMachine"];
        assert_eq!(vm["bootDiskSizeGb"], json!(20));
        assert_eq!(vm["enableStackdriverMonitoring"], json!(true));
        assert_eq!(vm["serviceAccount"]["email"], json!("sa@p.iam.gserviceaccount.com"));
    }
}
