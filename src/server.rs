use std::path::Path;
use std::pin::pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use url::Url;

use crate::config::{Framework, ProjectConfig};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(
        "No server running on {origin} and no startCommand configured. Either start the dev server manually or add \"startCommand\" to .ux-test.json"
    )]
    MissingStartCommand { origin: String },
    #[error("Failed to start server: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Server exited before it was ready ({0})")]
    Exited(ExitStatus),
    #[error("Server startup timed out after {}s ({origin})", .after.as_secs_f64())]
    StartupTimeout { origin: String, after: Duration },
}

pub struct ServerOptions<'a> {
    pub origin: &'a Url,
    pub start_command: Option<&'a str>,
    pub dir: &'a Path,
    pub readiness_markers: &'a [&'a str],
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl<'a> ServerOptions<'a> {
    pub fn for_project(config: &'a ProjectConfig, origin: &'a Url) -> Self {
        ServerOptions {
            origin,
            start_command: config.start_command.as_deref(),
            dir: &config.dir,
            readiness_markers: Framework::readiness_markers(config.framework),
            startup_timeout: config.timeouts.server_startup(),
            poll_interval: config.timeouts.server_poll(),
            probe_timeout: config.timeouts.probe(),
        }
    }
}

/// A dev server this run either reused or started.
///
/// A started server lives in its own process group, which [`stop`] (or, as
/// a last resort, dropping the handle) terminates. Reused servers are
/// never touched.
///
/// [`stop`]: ServerHandle::stop
pub struct ServerHandle {
    process: Option<StartedProcess>,
}

struct StartedProcess {
    child: Child,
    pid: Option<u32>,
}

impl ServerHandle {
    pub fn reused() -> Self {
        ServerHandle { process: None }
    }

    pub fn started(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.pid)
    }

    /// Terminates a started server. Later calls do nothing.
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
            info!("stopped dev server");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(process) = &mut self.process {
            process.signal(Signal::Kill);
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

impl StartedProcess {
    fn signal(&mut self, signal: Signal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal as Unix, killpg};
            use nix::unistd::Pid;
            let unix = match signal {
                Signal::Terminate => Unix::SIGTERM,
                Signal::Kill => Unix::SIGKILL,
            };
            if let Err(error) = killpg(Pid::from_raw(pid as i32), unix) {
                debug!("signal {:?} to process group {}: {}", signal, pid, error);
            }
            return;
        }
        let _ = signal;
        if let Err(error) = self.child.start_kill() {
            debug!("kill dev server: {}", error);
        }
    }

    async fn terminate(&mut self) {
        self.signal(Signal::Terminate);
        if timeout(STOP_GRACE, self.child.wait()).await.is_err() {
            warn!(
                "dev server ignored SIGTERM for {}s, killing it",
                STOP_GRACE.as_secs()
            );
            self.signal(Signal::Kill);
            let _ = self.child.wait().await;
        }
    }
}

/// Whether anything answers HTTP at `origin`. Any status counts.
pub async fn is_reachable(
    client: &reqwest::Client,
    origin: &Url,
    probe_timeout: Duration,
) -> bool {
    client
        .get(origin.clone())
        .timeout(probe_timeout)
        .send()
        .await
        .is_ok()
}

/// Makes sure `options.origin` answers, starting the configured command
/// when nothing is listening yet.
pub async fn ensure(options: &ServerOptions<'_>) -> Result<ServerHandle, ServerError> {
    let client = reqwest::Client::new();
    if is_reachable(&client, options.origin, options.probe_timeout).await {
        info!("reusing server already running at {}", options.origin);
        return Ok(ServerHandle::reused());
    }

    let Some(start_command) = options.start_command else {
        return Err(ServerError::MissingStartCommand {
            origin: options.origin.to_string(),
        });
    };

    let mut process = spawn(start_command, options.dir)?;
    match wait_until_ready(&mut process, &client, options).await {
        Ok(()) => {
            info!("started dev server ({})", start_command);
            Ok(ServerHandle {
                process: Some(process),
            })
        }
        Err(error) => {
            process.terminate().await;
            Err(error)
        }
    }
}

fn spawn(start_command: &str, dir: &Path) -> Result<StartedProcess, ServerError> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(start_command)
        .current_dir(dir)
        .env("FORCE_COLOR", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(ServerError::Spawn)?;
    debug!("spawned `{}` in {}", start_command, dir.display());
    Ok(StartedProcess {
        pid: child.id(),
        child,
    })
}

// Lines are forwarded until the pipe closes, even after readiness, so the
// server never blocks on a full pipe.
fn forward_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    lines: mpsc::UnboundedSender<String>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("server: {}", line);
            let _ = lines.send(line);
        }
    });
}

async fn wait_until_ready(
    process: &mut StartedProcess,
    client: &reqwest::Client,
    options: &ServerOptions<'_>,
) -> Result<(), ServerError> {
    let (sender, mut lines) = mpsc::unbounded_channel();
    if let Some(stdout) = process.child.stdout.take() {
        forward_lines(stdout, sender.clone());
    }
    if let Some(stderr) = process.child.stderr.take() {
        forward_lines(stderr, sender);
    }

    let markers = options.readiness_markers;
    let mut signalled = pin!(async move {
        while let Some(line) = lines.recv().await {
            if markers.iter().any(|marker| line.contains(marker)) {
                debug!("readiness marker seen: {}", line);
                return;
            }
        }
        // Output closed without a marker; leave it to the poller.
        std::future::pending::<()>().await
    });

    let mut polled = pin!(async {
        let mut ticks = interval(options.poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if is_reachable(client, options.origin, options.probe_timeout).await {
                debug!("{} answered a probe", options.origin);
                return;
            }
        }
    });

    let mut deadline = pin!(sleep(options.startup_timeout));
    let mut running = true;

    loop {
        tokio::select! {
            _ = &mut signalled => return Ok(()),
            _ = &mut polled => return Ok(()),
            _ = &mut deadline => {
                return Err(ServerError::StartupTimeout {
                    origin: options.origin.to_string(),
                    after: options.startup_timeout,
                });
            }
            status = process.child.wait(), if running => match status {
                Ok(status) if status.success() => {
                    debug!("start command exited cleanly, still waiting");
                    running = false;
                }
                Ok(status) => return Err(ServerError::Exited(status)),
                Err(error) => return Err(ServerError::Spawn(error)),
            },
        }
    }
}
