use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use device_bridge::{
    cloud::{CloudRegistrar, LocalCommandQueue},
    config::AppConfig,
    http_client::ReqwestHttpClient,
    platform::{AvahiPublisher, NmcliNetwork, NmcliWifi},
    privet::{
        DeviceEndpoints, PrivetGateway, SecurityManager, TokenSecurityManager,
        security::PairingEvent,
    },
    settings::{Config, FileSettingsStore, Settings},
    wifi::{Network, WifiBootstrap},
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::{io::Write, sync::Arc, time::Duration};
use tokio::signal::unix::{SignalKind, signal};

const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(30);

type Registrar = CloudRegistrar<ReqwestHttpClient>;
type Gateway = PrivetGateway<ReqwestHttpClient, NmcliWifi>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let app_config = AppConfig::get();
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    std::fs::create_dir_all(&app_config.paths.data_dir)
        .context("failed to create data directory")?;

    let config = Arc::new(
        Config::load(
            Box::new(FileSettingsStore::new(&app_config.paths.settings_file)),
            Settings::from_app_config(app_config),
        )
        .context("failed to load settings")?,
    );

    let commands = LocalCommandQueue::from_file(&app_config.paths.command_defs_file)
        .context("failed to load command definitions")?;
    let cloud = CloudRegistrar::new(
        ReqwestHttpClient::new()?,
        config.clone(),
        Arc::new(commands),
    );

    if cloud.have_registration_credentials() {
        if let Err(e) = cloud.validate_and_refresh_access_token().await {
            warn!("initial access token refresh failed: {e}");
        }
    }

    let network: Arc<dyn Network> = Arc::new(NmcliNetwork::start().await);
    let wifi = WifiBootstrap::new(
        NmcliWifi::new(&app_config.wifi.interface),
        network.clone(),
        config.clone(),
        app_config.wifi.clone(),
    );

    let security = TokenSecurityManager::new(&config.settings());
    security.pairing_events().subscribe(|event| match event {
        PairingEvent::Started {
            session_id,
            mode,
            code,
        } => info!("pairing session {session_id} started, {mode}: {code}"),
        PairingEvent::Ended { session_id } => info!("pairing session {session_id} ended"),
    });
    let security: Arc<dyn SecurityManager> = Arc::new(security);

    let tls_config = load_tls_config().context("failed to load tls config")?;
    let endpoints = DeviceEndpoints {
        http_port: app_config.server.http_port,
        https_port: if tls_config.is_some() {
            app_config.server.https_port
        } else {
            0
        },
    };

    let gateway = Gateway::new(
        cloud.clone(),
        wifi,
        network,
        security,
        Arc::new(AvahiPublisher::new(config.settings().device_id.clone())),
        endpoints,
    );

    let (server_handle, server_task) = run_server(gateway, tls_config)?;
    let poller = tokio::spawn(poll_commands(cloud));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        },
    }

    info!("shutting down");
    poller.abort();
    server_handle.stop(true).await;
    info!("shutdown complete");

    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

fn run_server(
    gateway: Gateway,
    tls_config: Option<rustls::ServerConfig>,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let config = &AppConfig::get().server;
    let gateway = Data::new(gateway);

    let mut server =
        HttpServer::new(move || App::new().app_data(gateway.clone()).service(Gateway::scope()))
            .bind(("0.0.0.0", config.http_port))
            .context("failed to bind http server")?;

    if let Some(tls_config) = tls_config {
        server = server
            .bind_rustls_0_23(("0.0.0.0", config.https_port), tls_config)
            .context("failed to bind https server")?;
    }

    let server = server.disable_signals().run();

    Ok((server.handle(), tokio::spawn(server)))
}

async fn poll_commands(cloud: Registrar) {
    let mut ticker = tokio::time::interval(COMMAND_POLL_INTERVAL);

    loop {
        ticker.tick().await;

        if !cloud.have_registration_credentials() {
            continue;
        }

        match cloud.fetch_commands().await {
            Ok(proxies) => {
                for proxy in proxies {
                    info!("received cloud command {}", proxy.id());
                }
            }
            Err(e) => warn!("failed to fetch cloud commands: {e}"),
        }
    }
}

fn load_tls_config() -> Result<Option<rustls::ServerConfig>> {
    let server = &AppConfig::get().server;
    let (Some(cert_path), Some(key_path)) = (&server.cert_path, &server.key_path) else {
        info!("no certificate configured, serving http only");
        return Ok(None);
    };

    let mut tls_certs = std::io::BufReader::new(
        std::fs::File::open(cert_path).context("failed to open certificate file")?,
    );

    let mut tls_key =
        std::io::BufReader::new(std::fs::File::open(key_path).context("failed to open key file")?);

    let tls_certs = rustls_pemfile::certs(&mut tls_certs)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate pem")?;

    let key_item = rustls_pemfile::read_one(&mut tls_key)
        .context("failed to read key pem file")?
        .context("no valid key found in pem file")?;

    let key = match key_item {
        rustls_pemfile::Item::Pkcs1Key(key) => rustls::pki_types::PrivateKeyDer::Pkcs1(key),
        rustls_pemfile::Item::Pkcs8Key(key) => rustls::pki_types::PrivateKeyDer::Pkcs8(key),
        rustls_pemfile::Item::Sec1Key(key) => rustls::pki_types::PrivateKeyDer::Sec1(key),
        _ => anyhow::bail!("unexpected key type in pem file"),
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(tls_certs, key)
        .context("failed to create tls config")?;

    Ok(Some(config))
}
