use std::{future::Future, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::{sync::watch, task::JoinSet};
use tracing::Instrument;

use crate::ezturp::{
    config::{self, ClientConfig, Config, ConfigFormat, Protocol, ResolvedConfigPath, ServerConfig, Settings},
    logging,
    tunnel::{
        ClientOptions, ServerOptions, TunnelError, instance_span, shutdown_requested,
        tcp::{client::TcpClient, server::TcpServer},
        udp::{client::UdpClient, server::UdpServer},
    },
};

#[derive(Debug, Parser)]
#[command(
    name = "ezturp",
    version,
    about = "Expose a TCP or UDP service behind NAT through a public relay"
)]
pub struct Cli {
    /// Instance name shown in log output.
    #[arg(short = 'n', long, global = true, default_value = "")]
    pub name: String,

    /// Config file (.json, .toml, .yaml/.yml) or a directory containing ezturp.*.
    #[arg(long, env = "EZTURP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Inline JSON config; takes precedence over --config.
    #[arg(long, global = true)]
    pub json: Option<String>,

    /// debug, info, warn or error.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// stdout, stderr, discard or a file path.
    #[arg(long, global = true)]
    pub log_output: Option<String>,

    /// text or json.
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one TCP tunnel server.
    #[command(visible_alias = "ts")]
    TcpServer(ServerArgs),
    /// Run one UDP tunnel server.
    #[command(visible_alias = "us")]
    UdpServer(ServerArgs),
    /// Run one TCP tunnel client connection.
    #[command(visible_alias = "tc")]
    TcpClient(ClientArgs),
    /// Run one UDP tunnel client connection.
    #[command(visible_alias = "uc")]
    UdpClient(ClientArgs),
    /// Supervise every client in the config.
    #[command(visible_alias = "cm")]
    ClientManager,
    /// Supervise every server in the config.
    #[command(visible_alias = "sm")]
    ServerManager,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address tunnel clients connect to.
    #[arg(long)]
    pub internal: String,
    /// Address public users connect to.
    #[arg(long)]
    pub external: String,
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// The service to expose.
    #[arg(long)]
    pub local: String,
    /// The server's internal address.
    #[arg(long)]
    pub internal: String,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let is_manager = matches!(cli.command, Command::ClientManager | Command::ServerManager);
    let (mut cfg, resolved) = load(&cli, is_manager)?;

    if let Some(level) = &cli.log_level {
        cfg.logging.level = level.clone();
    }
    if let Some(output) = &cli.log_output {
        cfg.logging.output = output.clone();
    }
    if let Some(format) = &cli.log_format {
        cfg.logging.format = format.clone();
    }
    let _logrt = logging::init(&cfg.logging)?;

    if let Some(resolved) = &resolved {
        tracing::info!(path = %resolved.path.display(), source = %resolved.source, "config: loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let name = cli.name;
    let settings = cfg.settings.clone();

    match cli.command {
        Command::TcpServer(a) => {
            let server = TcpServer::new(server_options(name, a, settings));
            run_until_signal(server.listen(shutdown_rx)).await
        }
        Command::UdpServer(a) => {
            let server = UdpServer::new(server_options(name, a, settings));
            run_until_signal(server.listen(shutdown_rx)).await
        }
        Command::TcpClient(a) => {
            let client = TcpClient::new(client_options(name, a, settings));
            run_until_signal(client.connect(shutdown_rx)).await
        }
        Command::UdpClient(a) => {
            let client = UdpClient::new(client_options(name, a, settings));
            run_until_signal(client.connect(shutdown_rx)).await
        }
        Command::ClientManager => {
            if cfg.clients.is_empty() {
                anyhow::bail!("config: no clients configured");
            }
            let span = instance_span("ClientManager", &name);
            let mut tasks = JoinSet::new();
            for c in cfg.clients {
                tasks.spawn(supervise_client(c, settings.clone(), shutdown_rx.clone()).instrument(span.clone()));
            }
            manage(span, tasks, shutdown_tx).await
        }
        Command::ServerManager => {
            if cfg.servers.is_empty() {
                anyhow::bail!("config: no servers configured");
            }
            let span = instance_span("ServerManager", &name);
            let mut tasks = JoinSet::new();
            for s in cfg.servers {
                tasks.spawn(supervise_server(s, settings.clone(), shutdown_rx.clone()).instrument(span.clone()));
            }
            manage(span, tasks, shutdown_tx).await
        }
    }
}

/// Managers need a config; single instances only read one when asked to.
fn load(cli: &Cli, required: bool) -> anyhow::Result<(Config, Option<ResolvedConfigPath>)> {
    if let Some(json) = &cli.json {
        let cfg = config::parse_config(json, ConfigFormat::Json).context("load --json config")?;
        return Ok((cfg, None));
    }
    if !required && cli.config.is_none() {
        return Ok((Config::default(), None));
    }
    let resolved = config::resolve_config_path(cli.config.clone())?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    Ok((cfg, Some(resolved)))
}

fn server_options(name: String, a: ServerArgs, settings: Settings) -> ServerOptions {
    ServerOptions {
        name,
        internal_addr: a.internal,
        external_addr: a.external,
        settings,
    }
}

fn client_options(name: String, a: ClientArgs, settings: Settings) -> ClientOptions {
    ClientOptions {
        name,
        local_addr: a.local,
        internal_addr: a.internal,
        settings,
    }
}

async fn run_until_signal(
    instance: impl Future<Output = Result<(), TunnelError>>,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = instance => res.map_err(Into::into),
    }
}

async fn supervise_client(c: ClientConfig, settings: Settings, shutdown: watch::Receiver<bool>) {
    let opts = ClientOptions {
        name: c.name.clone(),
        local_addr: c.local_address.clone(),
        internal_addr: c.internal_address.clone(),
        settings: settings.clone(),
    };
    let protocol = c.protocol;
    supervise("client", &c.name, protocol, settings.restart_delay, shutdown, |rx| {
        let opts = opts.clone();
        async move {
            match protocol {
                Protocol::Tcp => TcpClient::new(opts).connect(rx).await,
                Protocol::Udp => UdpClient::new(opts).connect(rx).await,
            }
        }
    })
    .await
}

async fn supervise_server(s: ServerConfig, settings: Settings, shutdown: watch::Receiver<bool>) {
    let opts = ServerOptions {
        name: s.name.clone(),
        internal_addr: s.internal_address.clone(),
        external_addr: s.external_address.clone(),
        settings: settings.clone(),
    };
    let protocol = s.protocol;
    supervise("server", &s.name, protocol, settings.restart_delay, shutdown, |rx| {
        let opts = opts.clone();
        async move {
            match protocol {
                Protocol::Tcp => TcpServer::new(opts).listen(rx).await,
                Protocol::Udp => UdpServer::new(opts).listen(rx).await,
            }
        }
    })
    .await
}

/// Runs `run_once` over and over, pausing `restart_delay` between runs, until shutdown.
async fn supervise<F, Fut>(
    kind: &'static str,
    name: &str,
    protocol: Protocol,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut run_once: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), TunnelError>>,
{
    loop {
        let res = run_once(shutdown.clone()).await;
        if *shutdown.borrow() {
            return;
        }
        match res {
            Ok(()) => tracing::info!(kind, name, protocol = %protocol, "manager: instance returned, restarting"),
            Err(err) => tracing::error!(kind, name, protocol = %protocol, err = %err, "manager: instance failed, restarting"),
        }
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn manage(
    span: tracing::Span,
    mut tasks: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    async move {
        tracing::info!(instances = tasks.len(), "manager: started");
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        let _ = shutdown_tx.send(true);

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            tracing::warn!("shutdown: drain timed out, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        Ok(())
    }
    .instrument(span)
    .await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_aliases_parse() {
        let cli = Cli::try_parse_from([
            "ezturp", "ts", "--internal", ":9000", "--external", ":9001", "-n", "edge",
        ])
        .unwrap();
        assert_eq!(cli.name, "edge");
        match cli.command {
            Command::TcpServer(a) => {
                assert_eq!(a.internal, ":9000");
                assert_eq!(a.external, ":9001");
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "ezturp", "--log-level", "debug", "uc", "--local", "127.0.0.1:53", "--internal", "relay:9100",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::UdpClient(_)));

        assert!(matches!(
            Cli::try_parse_from(["ezturp", "sm", "--json", "[]"]).unwrap().command,
            Command::ServerManager
        ));
    }

    #[test]
    fn inline_json_wins_over_config_path() {
        let cli = Cli::try_parse_from([
            "ezturp",
            "cm",
            "--config",
            "/nonexistent/ezturp.toml",
            "--json",
            r#"[{"name":"a","protocol":"tcp","local_address":"127.0.0.1:22","internal_address":"relay:9000"}]"#,
        ])
        .unwrap();
        let (cfg, resolved) = load(&cli, true).unwrap();
        assert!(resolved.is_none());
        assert_eq!(cfg.clients.len(), 1);
        assert_eq!(cfg.clients[0].name, "a");
    }

    #[test]
    fn single_instance_needs_no_config() {
        let cli = Cli::try_parse_from(["ezturp", "tc", "--local", "127.0.0.1:22", "--internal", "relay:9000"])
            .unwrap();
        let (cfg, resolved) = load(&cli, false).unwrap();
        assert!(resolved.is_none());
        assert_eq!(cfg.settings, Settings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let runs = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = runs.clone();

        let task = tokio::spawn(supervise(
            "client",
            "flaky",
            Protocol::Tcp,
            Duration::from_secs(1),
            rx,
            move |_rx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(TunnelError::NoInternalLink)
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 4);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
