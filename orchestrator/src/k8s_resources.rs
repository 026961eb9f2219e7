//! Cluster-level Kubernetes state, captured once per run by the driver.

use crate::{
    error::TransportError,
    transport::{
        ExecOptions,
        KubectlTransport,
    },
};
use eyre::{
    Context as _,
    Result,
};
use serde::Deserialize;
use std::path::{
    Path,
    PathBuf,
};
use tokio::process::Command;

pub const RESOURCE_KINDS: &[&str] = &[
    "nodes",
    "pods",
    "services",
    "statefulsets",
    "deployments",
    "persistentvolumeclaims",
    "events",
    "limitranges",
    "resourcequotas",
];

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Named,
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Named>,
    #[serde(default, rename = "initContainers")]
    init_containers: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

/// `(pod, container)` for every container of every pod in `pods_json`.
pub fn pod_containers(pods_json: &str) -> Result<Vec<(String, String)>> {
    let list: PodList = serde_json::from_str(pods_json).wrap_err("unreadable pod list")?;
    Ok(list
        .items
        .into_iter()
        .flat_map(|pod| {
            let name = pod.metadata.name;
            pod.spec
                .init_containers
                .into_iter()
                .chain(pod.spec.containers)
                .map(move |c| (name.clone(), c.name))
        })
        .collect())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn save(report: &mut ResourceReport, path: PathBuf, result: Result<String, TransportError>, what: &str) -> Result<(), TransportError> {
    match result {
        Ok(body) => {
            if let Err(err) = tokio::fs::write(&path, body).await {
                report.failed.push((what.to_string(), err.to_string()));
            } else {
                report.written.push(path);
            }
            Ok(())
        },
        Err(TransportError::Cancelled) => Err(TransportError::Cancelled),
        Err(err) => {
            warn!(what, "kubernetes capture failed: {err}");
            report.failed.push((what.to_string(), err.to_string()));
            Ok(())
        },
    }
}

/// Writes `<kind>.json` for every resource kind, `configmaps.json` with names
/// only, and `container-logs/<pod>-<container>.out` under `out`.
pub async fn collect(kubectl: &KubectlTransport, out: &Path) -> Result<ResourceReport, TransportError> {
    let logs_dir = out.join("container-logs");
    if let Err(err) = tokio::fs::create_dir_all(&logs_dir).await {
        return Err(TransportError::Copy {
            host: "kubectl".into(),
            from: "cluster".into(),
            to: logs_dir.display().to_string(),
            reason: err.to_string(),
        });
    }
    let mut report = ResourceReport::default();

    for kind in RESOURCE_KINDS {
        let result = kubectl.kubectl(&args(&["get", kind, "-o", "json"]), ExecOptions::default()).await;
        save(&mut report, out.join(format!("{kind}.json")), result, kind).await?;
    }

    let names = kubectl
        .kubectl(&args(&["get", "configmaps", "-o", "name"]), ExecOptions::default())
        .await
        .map(|text| {
            let names: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
            serde_json::json!({ "items": names }).to_string()
        });
    save(&mut report, out.join("configmaps.json"), names, "configmaps").await?;

    let pods = match kubectl.kubectl(&args(&["get", "pods", "-o", "json"]), ExecOptions::default()).await {
        Ok(json) => pod_containers(&json).unwrap_or_else(|err| {
            warn!("container logs skipped: {err}");
            Vec::new()
        }),
        Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
        Err(err) => {
            warn!("container logs skipped: {err}");
            Vec::new()
        },
    };
    for (pod, container) in pods {
        let result = kubectl
            .kubectl(&args(&["logs", &pod, "-c", &container]), ExecOptions::default())
            .await;
        let what = format!("{pod}/{container}");
        save(&mut report, logs_dir.join(format!("{pod}-{container}.out")), result, &what).await?;
    }

    info!(
        written = report.written.len(),
        failed = report.failed.len(),
        namespace = kubectl.namespace(),
        "kubernetes resources captured"
    );
    Ok(report)
}

/// Namespace of the current kubectl context, `default` when it sets none.
pub async fn detect_namespace(kubectl: &Path, context: Option<&str>) -> Result<String> {
    let mut cmd = Command::new(kubectl);
    if let Some(context) = context {
        cmd.arg("--context").arg(context);
    }
    cmd.args(["config", "view", "--minify", "-o", "jsonpath={..namespace}"]);
    cmd.kill_on_drop(true);
    let out = cmd.output().await.wrap_err("failed to run kubectl config view")?;
    if !out.status.success() {
        eyre::bail!(
            "kubectl config view failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    let namespace = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if namespace.is_empty() {
        debug!("context sets no namespace, using default");
        return Ok("default".to_string());
    }
    info!(namespace, "detected namespace");
    Ok(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn containers_of_every_pod() {
        let json = r#"{"items": [
            {"metadata": {"name": "dremio-master-0"},
             "spec": {"initContainers": [{"name": "chown"}], "containers": [{"name": "dremio-master-coordinator"}]}},
            {"metadata": {"name": "zk-0"}, "spec": {"containers": [{"name": "zookeeper"}, {"name": "metrics"}]}}
        ]}"#;
        let pods = pod_containers(json).unwrap();
        assert_eq!(
            pods,
            vec![
                ("dremio-master-0".to_string(), "chown".to_string()),
                ("dremio-master-0".to_string(), "dremio-master-coordinator".to_string()),
                ("zk-0".to_string(), "zookeeper".to_string()),
                ("zk-0".to_string(), "metrics".to_string()),
            ]
        );
    }

    #[test]
    fn every_kind_is_listed_once() {
        let mut kinds = RESOURCE_KINDS.to_vec();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), RESOURCE_KINDS.len());
        assert!(!RESOURCE_KINDS.contains(&"configmaps"));
    }
}
