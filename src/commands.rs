use crate::{
    logging::{
        self,
        console_level,
        DRIVER_LOG,
    },
    signals::forward_signals,
};
use ddc_collector::{
    read_pat,
    resolve_conf,
    LocalCollector,
    ShutdownHook,
};
use ddc_config::{
    CollectArgs,
    ConfigResolver,
    LocalCollectArgs,
};
use ddc_orchestrator::{
    k8s_resources::detect_namespace,
    Orchestrator,
    RunPlan,
    StatusModel,
};
use eyre::{
    bail,
    Result,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;

const PAT_PROMPT: &str = "Dremio personal access token (empty skips REST captures): ";

fn collect_pat(args: &CollectArgs) -> Result<Option<String>> {
    if args.pat_prompt {
        if args.disable_prompt {
            bail!("--pat-prompt cannot be combined with --disable-prompt, use --pat-stdin");
        }
        let pat = ddc_tui::prompt_secret(PAT_PROMPT)?;
        let pat = pat.trim();
        return Ok((!pat.is_empty()).then(|| pat.to_string()));
    }
    read_pat(args.pat_stdin, args.dremio_pat_token.as_deref())
}

/// Driver: collect from every node into one archive.
pub async fn collect(args: CollectArgs) -> Result<()> {
    let machine = args.disable_prompt;
    let pat = collect_pat(&args)?;
    if pat.is_none() {
        info!("no personal access token given, REST captures are skipped");
    }
    let conf = ConfigResolver::new(args.ddc_yaml.clone(), args.overrides()?).resolve()?;
    let verbosity = conf.verbosity();

    let namespace = match (&args.namespace, args.detect_namespace) {
        (Some(namespace), _) => Some(namespace.clone()),
        (None, true) => Some(detect_namespace(Path::new("kubectl"), args.kube_context.as_deref()).await?),
        (None, false) => None,
    };
    let plan = RunPlan::from_args(&args, conf, pat, namespace)?;

    let log_file = plan.output_dir().join(DRIVER_LOG);
    logging::log_init(&log_file, (!machine).then(|| console_level(verbosity)))?;
    info!(version = env!("CARGO_PKG_VERSION"), ?plan, "starting collection");

    let hook = ShutdownHook::new();
    forward_signals(hook.clone())?;
    let status = if machine { StatusModel::machine() } else { StatusModel::human() };
    let orchestrator = Orchestrator::new(plan, status.clone(), hook.clone(), Some(log_file));

    let result = if machine {
        orchestrator.run().await
    } else {
        let finished = CancellationToken::new();
        let done = finished.clone();
        let run = tokio::spawn(async move {
            let result = orchestrator.run().await;
            done.cancel();
            result
        });
        if let Err(err) = ddc_tui::run_dashboard(status.clone(), hook.clone(), finished).await {
            warn!("dashboard unavailable: {err}");
        }
        run.await?
    };
    hook.cleanup().await;

    status.update_runtime();
    if !machine {
        println!("{}", ddc_tui::final_report(&status.snapshot()));
    }
    result.map(|files| info!(?files, "collection finished"))
}

/// Node side: run the local pipeline and pack `<node>.tar.gz`.
pub async fn local_collect(args: LocalCollectArgs) -> Result<()> {
    let pat = read_pat(args.pat_stdin, args.dremio_pat_token.as_deref())?;
    let conf = resolve_conf(&args, pat.as_deref())?;
    let verbosity = conf.verbosity();

    let hook = ShutdownHook::new();
    let collector = LocalCollector::new(conf, hook.clone(), args.pid_file.clone());
    collector.prepare()?;
    logging::log_init(&collector.layout().log_file(), Some(console_level(verbosity)))?;
    forward_signals(hook.clone())?;

    let result = collector.run().await;
    hook.cleanup().await;
    let tarball = result?;
    println!("{}", tarball.display());
    Ok(())
}
