mod cli;
mod service;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{AppConfig, Cli};
use krbgate_core::auth::AuthProvider;
use krbgate_core::checker;
use krbgate_core::static_srv::StaticServer;
use krbgate_core::Proxy;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut install = false;
    #[allow(unused_mut, unused_variables)]
    let mut service_mode = false;

    let config: AppConfig = 'config: {
        // A bare invocation falls back to the settings persisted at install
        // time, if there are any.
        if std::env::args_os().len() == 1 {
            if let Some(path) = cli::settings_path() {
                if path.exists() {
                    match cli::load_settings(&path) {
                        Ok(config) => break 'config config,
                        Err(e) => {
                            eprintln!("Invalid config file: {:#}", e);
                            return 1;
                        }
                    }
                }
            }
        }

        let parsed = match Cli::try_parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                use clap::error::ErrorKind;
                let code = match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                    _ => 1,
                };
                let _ = e.print();
                return code;
            }
        };

        if parsed.uninstall {
            init_logging(parsed.verbose);
            return match service::uninstall() {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "error while trying to uninstall service");
                    1
                }
            };
        }

        install = parsed.install;
        #[cfg(windows)]
        {
            service_mode = parsed.service;
        }

        match parsed.into_config() {
            Ok(config) => break 'config config,
            Err(e) => {
                eprintln!("Invalid args: {:#}", e);
                return 1;
            }
        }
    };

    if let Err(e) = config.proxy.validate() {
        eprintln!("Invalid args: {:#}", e);
        return 1;
    }

    init_logging(config.verbose);

    if install {
        match cli::settings_path() {
            Some(path) => {
                if let Err(e) = cli::save_settings(&path, &config) {
                    error!(error = %format!("{:#}", e), "error while trying to save config");
                    return 1;
                }
                info!(path = %path.display(), "settings saved");
            }
            None => {
                error!("cannot determine the configuration directory");
                return 1;
            }
        }
        return match service::install() {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %format!("{:#}", e), "error while trying to install service");
                1
            }
        };
    }

    #[cfg(windows)]
    if service_mode {
        return run_service(config);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot create runtime: {}", e);
            return 1;
        }
    };

    match runtime.block_on(run_servers(config, wait_for_ctrl_c())) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{:#}", e), "error while running proxy");
            1
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Bring up the proxy, the static server and the credential probe; tear
/// everything down once `shutdown` resolves.
async fn run_servers(config: AppConfig, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let proxy_config = Arc::new(config.proxy);
    let auth = Arc::new(AuthProvider::from_config(&proxy_config)?);
    let proxy = Arc::new(Proxy::new(Arc::clone(&proxy_config), auth)?);

    let ca_host = proxy_config
        .ping_url
        .host_str()
        .unwrap_or("www.google.com")
        .to_string();
    let statics = Arc::new(StaticServer::new(
        &config.static_addr,
        &proxy_config.addr,
        &ca_host,
    ));

    let proxy_listener = proxy.bind().await?;
    let static_listener = statics.bind().await?;

    let proxy_task = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.serve(proxy_listener).await })
    };
    let static_task = {
        let statics = Arc::clone(&statics);
        tokio::spawn(async move { statics.serve(static_listener).await })
    };

    // Check auth against the real upstream once the listener is serving.
    {
        let addr = proxy_config.addr.clone();
        let ping_url = proxy_config.ping_url.clone();
        tokio::spawn(async move {
            match checker::check_credentials(&addr, &ping_url).await {
                Ok(true) => info!("downstream proxy credentials are valid"),
                Ok(false) => error!("provided credentials are invalid"),
                Err(e) => error!(
                    ping_url = %ping_url,
                    error = %format!("{:#}", e),
                    "cannot check proxy and credentials validity"
                ),
            }
        });
    }

    shutdown.await;
    info!("stopping proxy");

    // The static server goes first; its connections are short-lived.
    statics.shutdown();
    if let Ok(Err(e)) = static_task.await {
        error!(error = %format!("{:#}", e), "error while shutting down the static server");
    }

    proxy.shutdown();
    if let Ok(Err(e)) = proxy_task.await {
        error!(error = %format!("{:#}", e), "error while shutting down the proxy server");
    }

    info!("proxy stopped");
    Ok(())
}

#[cfg(windows)]
fn run_service(config: AppConfig) -> i32 {
    use std::sync::OnceLock;
    static CONFIG: OnceLock<AppConfig> = OnceLock::new();
    let _ = CONFIG.set(config);

    fn entry(stop: tokio::sync::oneshot::Receiver<()>) {
        let Some(config) = CONFIG.get().cloned() else {
            return;
        };
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(error = %e, "cannot create runtime");
                return;
            }
        };
        if let Err(e) = runtime.block_on(run_servers(config, async {
            let _ = stop.await;
        })) {
            error!(error = %format!("{:#}", e), "error while running proxy");
        }
    }

    match service::windows::run(entry) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{:#}", e), "service dispatcher failed");
            1
        }
    }
}
