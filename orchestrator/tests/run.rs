use ddc_collector::{
    archive,
    ShutdownHook,
};
use ddc_config::CaptureConf;
use ddc_orchestrator::{
    transport::{
        cancel_registered,
        ExecOptions,
        SshOptions,
        Transport,
        TransportFuture,
    },
    NodeResult,
    Orchestrator,
    Phase,
    RunPlan,
    StatusModel,
    TransportError,
    TransportKind,
};
use pretty_assertions::assert_eq;
use std::{
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

const PAT: &str = "pat-secret-value";

#[derive(Default)]
struct Recorded {
    execs: Vec<(String, Vec<String>)>,
    stdin: Vec<(String, String)>,
    killed: Vec<(String, String)>,
}

/// Answers the driver's remote commands from memory.
struct FakeTransport {
    coordinators: Vec<String>,
    executors: Vec<String>,
    token: CancellationToken,
    block_collect: bool,
    failing: HashSet<String>,
    tarballs: HashMap<String, PathBuf>,
    pids: Mutex<BTreeMap<String, String>>,
    seen: Mutex<Recorded>,
}

impl FakeTransport {
    async fn answer(&self, host: &str, argv: &[String], opts: ExecOptions) -> Result<String, TransportError> {
        if opts.unbound {
            return match argv[0].as_str() {
                "cat" => Ok("4242\n".to_string()),
                "kill" => {
                    self.seen.lock().unwrap().killed.push((host.to_string(), argv[2].clone()));
                    Ok(String::new())
                },
                _ => Ok(String::new()),
            };
        }
        if self.token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        {
            let mut seen = self.seen.lock().unwrap();
            seen.execs.push((host.to_string(), argv.to_vec()));
            if let Some(stdin) = &opts.stdin {
                seen.stdin.push((host.to_string(), String::from_utf8_lossy(stdin).into_owned()));
            }
        }
        if self.failing.contains(host) {
            return Err(TransportError::Exec {
                host: host.to_string(),
                code: Some(255),
                output: "connection refused".to_string(),
            });
        }
        match argv.get(1).map(String::as_str) {
            Some("local-collect") if self.block_collect => {
                self.token.cancelled().await;
                Err(TransportError::Cancelled)
            },
            Some("/proc/sys/kernel/hostname") => Ok(format!("{host}\n")),
            _ if argv[0] == "sha1sum" => Err(TransportError::Exec {
                host: host.to_string(),
                code: Some(1),
                output: "No such file".to_string(),
            }),
            _ => Ok(String::new()),
        }
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn discover_coordinators(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.coordinators.clone()) })
    }

    fn discover_executors(&self) -> TransportFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.executors.clone()) })
    }

    fn exec<'a>(&'a self, host: &'a str, argv: &'a [String], opts: ExecOptions) -> TransportFuture<'a, String> {
        Box::pin(self.answer(host, argv, opts))
    }

    fn copy_to<'a>(&'a self, _host: &'a str, local: &'a Path, _remote: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            assert!(local.is_file(), "pushed file {} missing", local.display());
            Ok(())
        })
    }

    fn copy_from<'a>(&'a self, host: &'a str, remote: &'a str, local: &'a Path) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            assert_eq!(remote, format!("/tmp/ddc/{host}.tar.gz"));
            std::fs::copy(&self.tarballs[host], local).map_err(|err| TransportError::Copy {
                host: host.to_string(),
                from: remote.to_string(),
                to: local.display().to_string(),
                reason: err.to_string(),
            })?;
            Ok(())
        })
    }

    fn register_remote_pid(&self, host: &str, pid_file: &str) {
        self.pids.lock().unwrap().insert(host.to_string(), pid_file.to_string());
    }

    fn cancel_all(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let registered: Vec<_> = self.pids.lock().unwrap().clone().into_iter().collect();
            cancel_registered(self, registered).await;
            Ok(())
        })
    }
}

fn node_tarball(dir: &Path, node: &str) -> PathBuf {
    let src = dir.join(format!("src-{node}"));
    let stats = src.join("cluster-stats").join(node);
    std::fs::create_dir_all(&stats).unwrap();
    std::fs::write(
        stats.join("cluster-stats.json"),
        format!(r#"{{"node_name":"{node}","version":"25.0.1","cluster_id":"5f1c7d2e-0000-4000-8000-000000000001"}}"#),
    )
    .unwrap();
    let logs = src.join("logs").join(node);
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(logs.join("server.log"), format!("{node} started\n")).unwrap();
    let tarball = dir.join(format!("{node}.tar.gz"));
    archive::compact(&src, &tarball, |_| true).unwrap();
    tarball
}

struct Fixture {
    dir: tempfile::TempDir,
    hook: ShutdownHook,
    status: StatusModel,
    fake: Arc<FakeTransport>,
}

impl Fixture {
    fn new(coordinators: &[&str], executors: &[&str], block_collect: bool, failing: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hook = ShutdownHook::new();
        let tarballs = coordinators
            .iter()
            .chain(executors)
            .map(|n| (n.to_string(), node_tarball(dir.path(), n)))
            .collect();
        let fake = Arc::new(FakeTransport {
            coordinators: coordinators.iter().map(|s| s.to_string()).collect(),
            executors: executors.iter().map(|s| s.to_string()).collect(),
            token: hook.token(),
            block_collect,
            failing: failing.iter().map(|s| s.to_string()).collect(),
            tarballs,
            pids: Default::default(),
            seen: Default::default(),
        });
        Self {
            dir,
            hook,
            status: StatusModel::human(),
            fake,
        }
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("out").join("diag.tgz")
    }

    fn orchestrator(&self) -> Orchestrator {
        let binary = self.dir.path().join("ddc-bin");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();
        let plan = RunPlan {
            conf: CaptureConf {
                disable_free_space_check: true,
                ..CaptureConf::default()
            },
            transport: TransportKind::Ssh(SshOptions::default()),
            pat: Some(PAT.to_string()),
            transfer_dir: "/tmp/ddc".to_string(),
            collector_binary: binary,
            output_file: self.output(),
            transfer_threads: 1,
            split_bytes: None,
            disable_kubectl: true,
        };
        Orchestrator::with_transport(plan, self.fake.clone(), self.status.clone(), self.hook.clone())
    }
}

fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn collects_every_node_into_one_archive() {
    let fx = Fixture::new(&["c1"], &["e1", "c1"], false, &[]);
    let outputs = fx.orchestrator().run().await.unwrap();
    assert_eq!(outputs, vec![fx.output()]);
    fx.hook.cleanup().await;

    let extracted = fx.dir.path().join("extracted");
    archive::extract(&fx.output(), &extracted, None).unwrap();
    let files = files_under(&extracted);
    assert!(files.contains(&"summary.json".to_string()), "{files:?}");
    for node in ["c1", "e1"] {
        let stats = format!("-DDC/cluster-stats/{node}/cluster-stats.json");
        assert!(files.iter().any(|f| f.ends_with(&stats)), "{files:?}");
    }

    let summary: serde_json::Value =
        serde_json::from_slice(&std::fs::read(extracted.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["coordinators"], serde_json::json!(["c1"]));
    assert_eq!(summary["executors"], serde_json::json!(["e1"]));
    assert_eq!(summary["clusterInfo"]["totalNodesAttempted"], 2);
    assert_eq!(summary["dremioVersion"]["c1"], "25.0.1");
    let total: u64 = summary["collectedFiles"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["size"].as_u64().unwrap())
        .sum();
    assert_eq!(summary["totalBytesCollected"].as_u64().unwrap(), total);

    let snapshot = fx.status.snapshot();
    assert!(snapshot.nodes.values().all(|n| n.result == NodeResult::Success));
    assert_eq!(snapshot.warnings.len(), 1, "duplicate node warning");

    let seen = fx.fake.seen.lock().unwrap();
    assert_eq!(seen.stdin, vec![("c1".to_string(), format!("{PAT}\n"))]);
    assert!(seen.execs.iter().all(|(_, argv)| !argv.iter().any(|a| a.contains(PAT))));
    let executor_run = seen
        .execs
        .iter()
        .find(|(host, argv)| host == "e1" && argv.get(1).map(String::as_str) == Some("local-collect"))
        .unwrap();
    assert!(executor_run.1.contains(&"--disable-rest-api".to_string()));

    // Work directory and run lock are gone after cleanup.
    let out_dir = fx.output().parent().unwrap().to_path_buf();
    let left: Vec<_> = std::fs::read_dir(out_dir).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(left, vec![std::ffi::OsString::from("diag.tgz")]);
}

#[tokio::test]
async fn failing_node_does_not_stop_its_peers() {
    let fx = Fixture::new(&["c1"], &["e1"], false, &["e1"]);
    fx.orchestrator().run().await.unwrap();
    fx.hook.cleanup().await;

    let e1 = fx.status.node("e1").unwrap();
    assert_eq!(e1.phase, Phase::Failed);
    assert!(e1.error_message.unwrap().contains("connection refused"));
    assert_eq!(fx.status.node("c1").unwrap().result, NodeResult::Success);

    let extracted = fx.dir.path().join("extracted");
    archive::extract(&fx.output(), &extracted, None).unwrap();
    let summary: serde_json::Value =
        serde_json::from_slice(&std::fs::read(extracted.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["failedFiles"][0]["path"], "e1");
    assert_eq!(summary["clusterInfo"]["numberNodesContacted"], 1);
}

#[tokio::test]
async fn cancellation_stops_remote_collectors_and_writes_nothing() {
    let fx = Fixture::new(&["c1"], &["e1"], true, &[]);
    let orchestrator = fx.orchestrator();
    let run = tokio::spawn(async move { orchestrator.run().await });

    let collecting = async {
        loop {
            let snapshot = fx.status.snapshot();
            if snapshot.nodes.len() == 2 && snapshot.count_in(Phase::Collecting) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collecting).await.unwrap();

    fx.hook.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();
    assert!(result.unwrap_err().to_string().contains("cancelled"));
    tokio::time::timeout(Duration::from_secs(10), fx.hook.cleanup()).await.unwrap();

    for node in ["c1", "e1"] {
        let state = fx.status.node(node).unwrap();
        assert_eq!(state.phase, Phase::Cancelled);
        assert_eq!(state.remote_pid_file.as_deref(), Some("/tmp/ddc/ddc.pid"));
    }
    let mut killed = fx.fake.seen.lock().unwrap().killed.clone();
    killed.sort();
    assert_eq!(
        killed,
        vec![("c1".to_string(), "4242".to_string()), ("e1".to_string(), "4242".to_string())]
    );
    assert!(!fx.output().exists());
}
