/// System service integration.
///
/// On Windows the proxy can register itself with the service control manager
/// and run under it. Elsewhere `--install` only persists the settings file;
/// process supervision is left to the init system.

use anyhow::Result;

pub const SERVICE_NAME: &str = "krbgate";

#[cfg(windows)]
pub mod windows {
    use super::SERVICE_NAME;
    use anyhow::{Context, Result};
    use std::ffi::OsString;
    use std::time::Duration;
    use windows_service::service::{
        ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl, ServiceExitCode,
        ServiceInfo, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    };
    use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
    use windows_service::{define_windows_service, service_dispatcher};

    pub fn install() -> Result<()> {
        let manager = ServiceManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )
        .context("cannot connect to the service manager")?;

        let info = ServiceInfo {
            name: OsString::from(SERVICE_NAME),
            display_name: OsString::from("krbgate Proxy"),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: std::env::current_exe().context("cannot resolve executable path")?,
            launch_arguments: vec![OsString::from("--service")],
            dependencies: vec![],
            account_name: None,
            account_password: None,
        };
        manager
            .create_service(&info, ServiceAccess::QUERY_STATUS)
            .context("cannot create service")?;
        Ok(())
    }

    pub fn uninstall() -> Result<()> {
        let manager =
            ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
                .context("cannot connect to the service manager")?;
        let service = manager
            .open_service(SERVICE_NAME, ServiceAccess::DELETE)
            .context("cannot open service")?;
        service.delete().context("cannot delete service")?;
        Ok(())
    }

    /// Hand the process over to the service dispatcher. `run` is the async
    /// server entry; it finishes when the SCM asks for a stop.
    pub fn run(run_servers: fn(tokio::sync::oneshot::Receiver<()>)) -> Result<()> {
        // The dispatcher requires a function with a fixed signature, so the
        // entry point travels through a process-global.
        use std::sync::OnceLock;
        static ENTRY: OnceLock<fn(tokio::sync::oneshot::Receiver<()>)> = OnceLock::new();
        let _ = ENTRY.set(run_servers);

        define_windows_service!(ffi_service_main, service_main);

        fn service_main(_args: Vec<OsString>) {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let mut stop_tx = Some(stop_tx);

            let status_handle =
                service_control_handler::register(SERVICE_NAME, move |control| match control {
                    ServiceControl::Stop => {
                        if let Some(tx) = stop_tx.take() {
                            let _ = tx.send(());
                        }
                        ServiceControlHandlerResult::NoError
                    }
                    ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                    _ => ServiceControlHandlerResult::NotImplemented,
                })
                .expect("cannot register service control handler");

            status_handle
                .set_service_status(ServiceStatus {
                    service_type: ServiceType::OWN_PROCESS,
                    current_state: ServiceState::Running,
                    controls_accepted: ServiceControlAccept::STOP,
                    exit_code: ServiceExitCode::Win32(0),
                    checkpoint: 0,
                    wait_hint: Duration::default(),
                    process_id: None,
                })
                .expect("cannot set service status");

            if let Some(entry) = ENTRY.get() {
                entry(stop_rx);
            }

            let _ = status_handle.set_service_status(ServiceStatus {
                service_type: ServiceType::OWN_PROCESS,
                current_state: ServiceState::Stopped,
                controls_accepted: ServiceControlAccept::empty(),
                exit_code: ServiceExitCode::Win32(0),
                checkpoint: 0,
                wait_hint: Duration::default(),
                process_id: None,
            });
        }

        service_dispatcher::start(SERVICE_NAME, ffi_service_main)
            .context("cannot start service dispatcher")?;
        Ok(())
    }
}

#[cfg(not(windows))]
pub fn install() -> Result<()> {
    tracing::info!("settings persisted; register the binary with your init system to run it as a service");
    Ok(())
}

#[cfg(not(windows))]
pub fn uninstall() -> Result<()> {
    tracing::info!("nothing to uninstall on this platform");
    Ok(())
}

#[cfg(windows)]
pub fn install() -> Result<()> {
    windows::install()
}

#[cfg(windows)]
pub fn uninstall() -> Result<()> {
    windows::uninstall()
}
