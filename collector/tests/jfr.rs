#![cfg(unix)]

use ddc_collector::{
    jobs::JfrStartJob,
    pipeline::Job,
    CaptureContext,
    OutputLayout,
    ShutdownHook,
};
use ddc_config::CaptureConf;
use pretty_assertions::assert_eq;
use std::{
    fs,
    os::unix::fs::PermissionsExt as _,
    sync::Arc,
};

#[tokio::test]
async fn cancelled_run_stops_the_recording() {
    if which::which("jcmd").is_ok() {
        // A real JDK on PATH would be picked over the fake one.
        return;
    }
    let java_home = tempfile::tempdir().unwrap();
    let bin = java_home.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let calls = java_home.path().join("calls.log");
    let script = format!("#!/bin/sh\necho \"$@\" >> '{}'\n", calls.display());
    fs::write(bin.join("jcmd"), script).unwrap();
    fs::set_permissions(bin.join("jcmd"), fs::Permissions::from_mode(0o755)).unwrap();
    std::env::set_var("JAVA_HOME", java_home.path());

    let conf = CaptureConf {
        dremio_pid: 4242,
        collect_jfr: true,
        ..CaptureConf::default()
    };
    let root = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(root.path(), "node-1");
    layout.create_all().unwrap();
    let hook = ShutdownHook::new();
    let mut ctx = CaptureContext::new(Arc::new(conf), layout, hook.clone(), None);

    JfrStartJob.run(&mut ctx).await.unwrap();
    hook.cancel();
    hook.cleanup().await;

    let lines = fs::read_to_string(&calls).unwrap();
    assert_eq!(
        lines.lines().collect::<Vec<_>>(),
        vec!["4242 JFR.start name=DDC settings=profile", "4242 JFR.stop name=DDC"]
    );
}
