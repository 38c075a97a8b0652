use super::{server_args, spawn_line_pump, spawn_stderr_drain};
use crate::errors::AppResult;
use crate::events::UiEvents;
use crate::harness::classifier::StreamClassifier;
use crate::harness::exit_hook::ExitHook;
use crate::models::TransportConfig;
use crate::supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor};
use std::sync::Mutex as StdMutex;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// The worker running in server mode behind the HTTP and socket transports.
pub(crate) struct WorkerServer {
    supervisor: ProcessSupervisor,
    handle: StdMutex<Option<ProcessHandle>>,
}

impl WorkerServer {
    /// Reuses a server already listening on the configured port, otherwise
    /// spawns one. Its stdout goes to the UI like untracked worker output.
    pub async fn ensure(
        config: &TransportConfig,
        supervisor: ProcessSupervisor,
        events: UiEvents,
    ) -> AppResult<Self> {
        if port_open(&config.host, config.port).await {
            tracing::info!(host = %config.host, port = config.port, "reusing running worker server");
            return Ok(Self {
                supervisor,
                handle: StdMutex::new(None),
            });
        }

        let launch = LaunchSpec::from(config);
        let exit = ExitHook::new();
        let port = config.port;
        exit.on_exit(move |exit| tracing::info!(port, exit = ?exit, "worker server exited"));

        let spawned = supervisor.start(&launch, &server_args(port), exit).await?;
        let handle = spawned.handle;
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = spawned.stdout {
            drains.push(spawn_line_pump(stdout, StreamClassifier::detached(events)));
        }
        if let Some(stderr) = spawned.stderr {
            drains.push(spawn_stderr_drain(stderr, handle.pid()));
        }
        supervisor.wait_async(&handle, drains);
        tracing::info!(pid = handle.pid(), port, "started worker server");

        Ok(Self {
            supervisor,
            handle: StdMutex::new(Some(handle)),
        })
    }

    pub fn spawned(&self) -> bool {
        self.lock().is_some()
    }

    /// Kills a server this process spawned. Reused servers are left alone.
    pub async fn shutdown(&self) {
        let handle = self.lock().take();
        if let Some(handle) = handle {
            self.supervisor.kill(&handle).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ProcessHandle>> {
        match self.handle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) async fn port_open(host: &str, port: u16) -> bool {
    matches!(
        timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
