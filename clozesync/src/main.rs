use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clozesync::config::SyncConfig;
use clozesync::deck::DeckRouter;
use clozesync::extract::MarkdownExtractor;
use clozesync::prompt::{DeletionPolicy, choose_deletions};
use clozesync::render::{PassthroughRenderer, ProcessRenderer, RenderService};
use clozesync::sync::orchestrator::Orchestrator;
use clozesync::sync::queue::RemoteQueue;
use clozesync::sync::remote::AnkiConnectStore;
use clozesync::sync::report::RunReport;
use clozesync::sync::store::FingerprintStore;
use clozesync_core::AnkiClient;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HALTED_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    help: bool,
    no_cache: bool,
    track_seen: bool,
    no_render: bool,
    deck: Option<String>,
    policy: DeletionPolicy,
    root: Option<PathBuf>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            help: false,
            no_cache: false,
            track_seen: false,
            no_render: false,
            deck: None,
            policy: DeletionPolicy::Ask,
            root: None,
        }
    }
}

fn parse_cli_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--no-cache" => parsed.no_cache = true,
            "--track-seen" => parsed.track_seen = true,
            "--no-render" => parsed.no_render = true,
            "--yes" | "-y" => parsed.policy = choose_policy(parsed.policy, DeletionPolicy::ConfirmAll)?,
            "--keep" => parsed.policy = choose_policy(parsed.policy, DeletionPolicy::KeepAll)?,
            "--deck" => {
                let deck = args.next().context("--deck needs a deck name")?;
                parsed.deck = Some(deck);
            }
            "--help" | "-h" => parsed.help = true,
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            other => {
                if parsed.root.is_some() {
                    anyhow::bail!("only one vault root may be given, got extra {other}");
                }
                parsed.root = Some(PathBuf::from(other));
            }
        }
    }
    Ok(parsed)
}

fn choose_policy(current: DeletionPolicy, next: DeletionPolicy) -> anyhow::Result<DeletionPolicy> {
    if current != DeletionPolicy::Ask && current != next {
        anyhow::bail!("--yes and --keep cannot be combined");
    }
    Ok(next)
}

fn print_usage() {
    println!("Usage: clozesync [OPTIONS] [ROOT]");
    println!("  --no-cache     Ignore the cache and re-check every file");
    println!("  --track-seen   Re-extract unchanged files to re-check deletions");
    println!("  --deck NAME    Send every card to deck NAME");
    println!("  --yes, -y      Delete every orphaned note without asking");
    println!("  --keep         Keep every orphaned note without asking");
    println!("  --no-render    Skip external math and image tools");
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clozesync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(mut config: SyncConfig, args: &CliArgs) -> anyhow::Result<RunReport> {
    anyhow::ensure!(
        config.root.is_dir(),
        "vault root {} is not a directory",
        config.root.display()
    );
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("failed to resolve vault root {}", config.root.display()))?;
    let store = if args.no_cache {
        FingerprintStore::empty_at(config.cache_file.clone())
    } else {
        FingerprintStore::load(&config.cache_file)
            .with_context(|| format!("failed to load cache {}", config.cache_file.display()))?
    };

    let client = AnkiClient::with_base_url(&config.anki_url)
        .with_context(|| format!("invalid AnkiConnect url {}", config.anki_url))?;
    let remote = Arc::new(RemoteQueue::new(
        Arc::new(AnkiConnectStore::new(client)),
        config.remote_retries,
    ));
    let renderer: Arc<dyn RenderService> = if args.no_render {
        Arc::new(PassthroughRenderer)
    } else {
        Arc::new(ProcessRenderer::new())
    };
    let mut router = DeckRouter::new(config.default_deck.clone());
    if let Some(rules) = &config.deck_rules {
        router = router.with_rules(DeckRouter::load_rules(rules)?);
    }

    let mut options = config.run_options();
    options.cache_disabled = args.no_cache;
    options.track_seen_forced = args.track_seen;
    options.target_deck_override = args.deck.clone();

    let mut orchestrator = Orchestrator::new(
        config.root.clone(),
        store,
        remote,
        Arc::new(MarkdownExtractor::new(config.root.clone())),
        renderer,
        router,
        options,
    )
    .with_ignore(config.ignore.clone());

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            cancel.cancel();
        }
    });

    let mut report = orchestrator.run().await?;
    let candidates = orchestrator.orphan_candidates().to_vec();
    if !candidates.is_empty() {
        let policy = args.policy;
        let confirmed = tokio::task::spawn_blocking(move || {
            let mut input = std::io::stdin().lock();
            let mut output = std::io::stdout();
            choose_deletions(&candidates, policy, &mut input, &mut output)
        })
        .await
        .context("deletion prompt task failed")?
        .context("failed to read deletion answers")?;
        orchestrator.apply_deletions(&confirmed, &mut report).await?;
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = parse_cli_args(std::env::args())?;
    if args.help {
        print_usage();
        return Ok(());
    }
    init_tracing();

    let mut config = SyncConfig::from_env()?;
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    let report = run(config, &args).await?;
    print!("{report}");
    if report.halted {
        warn!("remote store stayed unavailable, run halted");
        std::process::exit(HALTED_EXIT_CODE);
    }
    Ok(())
}
