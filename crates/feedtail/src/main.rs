mod args;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use relaypool::{Event, Pubkey, RelayPool};
use timeline::{
    ChannelHandler, EngineConfig, MediaUrlFingerprint, SubscriptionHandle, TimelineManager,
    TimelineUpdate,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::args::Args;

fn log_dir(args: &Args) -> PathBuf {
    if let Some(dir) = &args.logdir {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("feedtail").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

// the guard has to live as long as the program, or the file writer stops
fn setup_logging(log_path: PathBuf) -> WorkerGuard {
    use tracing_appender::{
        non_blocking,
        rolling::{RollingFileAppender, Rotation},
    };
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        log_path,
        format!("feedtail-{}.log", env!("CARGO_PKG_VERSION")),
    );
    let (non_blocking_writer, guard) = non_blocking(file_appender);

    // events go to stdout, so logs go to stderr
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_writer);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feedtail=info,relaypool=info,timeline=info"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    guard
}

fn print_event(ev: &Event) {
    let author = ev.pubkey.to_bech().unwrap_or_else(|| ev.pubkey.hex());
    let what = MediaUrlFingerprint::media_url(ev)
        .map(str::to_owned)
        .unwrap_or_else(|| ev.content.chars().take(80).collect());
    println!("{} {} {}", ev.created_at, author, what);
}

fn load_config(args: &Args) -> timeline::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if !args.relays.is_empty() {
        config.distribution.fallback_relays = args.relays.clone();
        config.distribution.global_relays = args.relays.clone();
    }
    if let Some(limit) = args.limit {
        config.distribution.limit = limit;
    }

    Ok(config)
}

/// Print the backlog. Returns false if the feed failed outright.
async fn print_backlog(rx: &mut UnboundedReceiver<TimelineUpdate>) -> bool {
    while let Some(update) = rx.recv().await {
        match update {
            TimelineUpdate::Batch {
                events,
                end_of_stored_events,
            } => {
                events.iter().for_each(print_event);
                if end_of_stored_events {
                    return true;
                }
            }
            TimelineUpdate::Live(ev) => print_event(&ev),
            TimelineUpdate::Closed { endpoint, reason } => {
                warn!("{endpoint} closed: {reason}")
            }
            TimelineUpdate::Failed(reason) => {
                error!("feed failed: {reason}");
                return false;
            }
        }
    }
    false
}

fn subscribe(
    manager: &TimelineManager,
    args: &Args,
    handler: ChannelHandler,
) -> Option<SubscriptionHandle> {
    if args.global || args.authors.is_empty() {
        info!("subscribing to the global feed");
        return manager.subscribe_global(Arc::new(handler));
    }

    let me = args
        .me
        .or_else(|| args.authors.first().copied())
        .unwrap_or_else(|| Pubkey::new([0; 32]));
    info!("subscribing to {} authors", args.authors.len());
    manager.subscribe_following(&args.authors, &me, Arc::new(handler))
}

async fn run(args: Args) -> timeline::Result<ExitCode> {
    let config = load_config(&args)?;
    let limit = config.distribution.limit;

    let pool = Arc::new(RelayPool::websocket(config.pool_config()));
    let maintenance = pool.spawn_maintenance();
    let manager = TimelineManager::new(pool.clone(), config);

    let (handler, mut rx) = ChannelHandler::new();
    let Some(handle) = subscribe(&manager, &args, handler) else {
        info!("nothing to subscribe to");
        return Ok(ExitCode::SUCCESS);
    };

    if !print_backlog(&mut rx).await {
        return Ok(ExitCode::FAILURE);
    }

    for _ in 0..args.pages {
        let page = manager.load_more(handle.key(), None, limit).await?;
        page.events.iter().for_each(print_event);
        if !page.has_more {
            break;
        }
    }

    if args.live {
        info!("waiting for live events, ctrl-c to stop");
        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Some(TimelineUpdate::Live(ev)) => print_event(&ev),
                    Some(TimelineUpdate::Closed { endpoint, reason }) => {
                        warn!("{endpoint} closed: {reason}")
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    let stats = manager.connection_stats();
    info!(
        "{} relays, {} connected, {} healthy, {} unhealthy",
        stats.total_connections,
        stats.active_connections,
        stats.healthy_count,
        stats.unhealthy_count
    );

    handle.cancel();
    maintenance.abort();
    pool.shutdown();
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (parsed, unrecognized) = Args::parse(&args);
    let _guard = setup_logging(log_dir(&parsed));

    for arg in unrecognized {
        warn!("unrecognized argument: {arg}");
    }

    match run(parsed).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
