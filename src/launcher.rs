//! Starting and stopping the listener or process behind a preview
//!
//! Static previews are served by an in-process listener bound to the
//! instance's port. Previews that ship server-side code run the configured
//! backend command in a private working directory.

use crate::app::AppDefinition;
use crate::config::BackendCommand;
use crate::error::PreviewError;
use crate::render::{PreviewRenderer, RenderedPreview};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Settings shared by every launch
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub listen_host: String,
    pub backend: Option<BackendCommand>,
    pub startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_path: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            backend: None,
            startup_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_millis(100),
            health_path: "/".to_string(),
        }
    }
}

/// In-process listener serving a rendered page
#[derive(Debug)]
pub struct StaticListener {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Backend process running an app's server-side code
#[derive(Debug)]
pub struct ProcessInstance {
    child: Child,
    // Removed from disk when the instance is dropped
    _workdir: tempfile::TempDir,
}

/// Handle to whatever serves a preview
#[derive(Debug)]
pub enum InstanceHandle {
    Static(StaticListener),
    Process(ProcessInstance),
    /// Refuses to stop
    #[cfg(test)]
    Stuck,
}

impl InstanceHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            InstanceHandle::Static(_) => "static",
            InstanceHandle::Process(_) => "process",
            #[cfg(test)]
            InstanceHandle::Stuck => "stuck",
        }
    }

    /// Handle around an arbitrary serving task
    #[cfg(test)]
    pub(crate) fn serving(task: JoinHandle<()>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        InstanceHandle::Static(StaticListener { shutdown_tx, task })
    }

    /// Stop serving, waiting at most `grace` before forcing
    pub async fn stop(&mut self, app_id: &str, grace: Duration) -> anyhow::Result<()> {
        match self {
            InstanceHandle::Static(listener) => {
                let _ = listener.shutdown_tx.send(true);
                match tokio::time::timeout(grace, &mut listener.task).await {
                    Ok(_) => debug!(app_id, "Static listener stopped"),
                    Err(_) => {
                        warn!(
                            app_id,
                            grace_period_ms = grace.as_millis() as u64,
                            "Grace period exceeded, aborting static listener"
                        );
                        listener.task.abort();
                    }
                }
                Ok(())
            }
            InstanceHandle::Process(process) => stop_process(app_id, &mut process.child, grace).await,
            #[cfg(test)]
            InstanceHandle::Stuck => anyhow::bail!("instance for '{}' refused to stop", app_id),
        }
    }
}

async fn stop_process(app_id: &str, child: &mut Child, grace: Duration) -> anyhow::Result<()> {
    if let Some(pid) = child.id() {
        info!(app_id, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(app_id, ?status, "Backend process exited");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(app_id, error = %e, "Error waiting for backend to exit, killing");
            child.kill().await?;
            Ok(())
        }
        Err(_) => {
            warn!(
                app_id,
                grace_period_ms = grace.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            child.kill().await?;
            Ok(())
        }
    }
}

/// Starts preview instances on allocated ports
pub struct InstanceLauncher {
    renderer: Arc<dyn PreviewRenderer>,
    settings: LaunchSettings,
}

impl InstanceLauncher {
    pub fn new(renderer: Arc<dyn PreviewRenderer>, settings: LaunchSettings) -> Self {
        Self { renderer, settings }
    }

    /// Start serving `def` on `port`
    ///
    /// On error nothing is left running on the port.
    pub async fn launch(&self, def: &AppDefinition, port: u16) -> Result<InstanceHandle, PreviewError> {
        let page = self
            .renderer
            .render(def)
            .map_err(|e| PreviewError::launch_failed(&def.app_id, format!("render failed: {}", e)))?;

        match (def.source.backend_code.as_deref(), self.settings.backend.as_ref()) {
            (Some(code), Some(backend)) => self.launch_process(def, port, page, code, backend).await,
            (Some(_), None) => {
                warn!(app_id = %def.app_id, "No backend command configured, serving static content only");
                self.launch_static(def, port, page).await
            }
            (None, _) => self.launch_static(def, port, page).await,
        }
    }

    async fn launch_static(
        &self,
        def: &AppDefinition,
        port: u16,
        page: RenderedPreview,
    ) -> Result<InstanceHandle, PreviewError> {
        let app_id = def.app_id.as_str();
        let listener = TcpListener::bind((self.settings.listen_host.as_str(), port))
            .await
            .map_err(|e| PreviewError::launch_failed(app_id, format!("bind {}: {}", port, e)))?;

        let bound = listener
            .local_addr()
            .map_err(|e| PreviewError::launch_failed(app_id, e))?
            .port();
        if bound != port {
            return Err(PreviewError::launch_failed(
                app_id,
                format!("listener bound to port {} instead of {}", bound, port),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve_static(listener, page, shutdown_rx, app_id.to_string()));

        info!(app_id, port, "Static instance listening");
        Ok(InstanceHandle::Static(StaticListener { shutdown_tx, task }))
    }

    async fn launch_process(
        &self,
        def: &AppDefinition,
        port: u16,
        page: RenderedPreview,
        code: &str,
        backend: &BackendCommand,
    ) -> Result<InstanceHandle, PreviewError> {
        let app_id = def.app_id.as_str();
        let fail = |e: &dyn std::fmt::Display| PreviewError::launch_failed(app_id, e);

        let workdir = tempfile::Builder::new()
            .prefix("preview-")
            .tempdir()
            .map_err(|e| fail(&e))?;
        let entrypoint = workdir.path().join(&backend.entrypoint);
        write_file(&entrypoint, code.as_bytes()).await.map_err(|e| fail(&e))?;
        write_file(&workdir.path().join("index.html"), &page.body)
            .await
            .map_err(|e| fail(&e))?;

        info!(app_id, port, command = %backend.command, "Starting backend process");

        let mut cmd = Command::new(&backend.command);
        cmd.args(&backend.args);
        cmd.arg(&entrypoint);
        cmd.current_dir(workdir.path());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.env("PORT", port.to_string());
        cmd.env("PREVIEW_APP_ID", app_id);
        cmd.env("PREVIEW_STATIC_DIR", workdir.path());

        let mut child = cmd.spawn().map_err(|e| fail(&e))?;
        let pid = child.id().unwrap_or(0);
        info!(app_id, pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, app_id.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, app_id.to_string(), "stderr"));
        }

        if let Err(cause) = self.wait_until_healthy(app_id, port, &mut child).await {
            error!(app_id, port, error = %cause, "Backend failed to become ready");
            let _ = child.kill().await;
            return Err(PreviewError::launch_failed(app_id, cause));
        }

        info!(app_id, port, "Backend process ready");
        Ok(InstanceHandle::Process(ProcessInstance {
            child,
            _workdir: workdir,
        }))
    }

    async fn wait_until_healthy(&self, app_id: &str, port: u16, child: &mut Child) -> anyhow::Result<()> {
        let start = Instant::now();
        let host_port = format!("{}:{}", self.settings.listen_host, port);

        loop {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("backend exited during startup with {}", status);
            }

            if check_health(&host_port, &self.settings.health_path).await {
                return Ok(());
            }

            if start.elapsed() > self.settings.startup_timeout {
                anyhow::bail!(
                    "startup timeout of {}ms exceeded",
                    self.settings.startup_timeout.as_millis()
                );
            }

            debug!(app_id, port, "Backend not ready yet");
            tokio::time::sleep(self.settings.health_check_interval).await;
        }
    }
}

async fn write_file(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.flush().await
}

async fn forward_output<R>(reader: R, app_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(app_id = %app_id, stream, "{}", line);
    }
}

/// GET `path` on `host_port` and report whether the answer was 2xx
async fn check_health(host_port: &str, path: &str) -> bool {
    let connect_result = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(host_port),
    )
    .await;

    let mut stream = match connect_result {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

async fn serve_static(
    listener: TcpListener,
    page: RenderedPreview,
    mut shutdown_rx: watch::Receiver<bool>,
    app_id: String,
) {
    let page = Arc::new(page);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let page = Arc::clone(&page);
                        let mut conn_shutdown = shutdown_rx.clone();
                        connections.spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let page = Arc::clone(&page);
                                async move { Ok::<_, hyper::Error>(page_response(&req, &page)) }
                            });
                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service);
                            tokio::pin!(conn);

                            tokio::select! {
                                _ = conn.as_mut() => {}
                                _ = shutdown_requested(&mut conn_shutdown) => {
                                    conn.as_mut().graceful_shutdown();
                                    let _ = conn.await;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        debug!(app_id = %app_id, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_requested(&mut shutdown_rx) => {
                break;
            }
            // Reap finished connections
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// Resolves once shutdown is signalled or the handle is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn page_response(req: &Request<Incoming>, page: &RenderedPreview) -> Response<BoxBody<Bytes, hyper::Error>> {
    let builder = Response::builder()
        .header(hyper::header::CONTENT_TYPE, page.content_type)
        .header(hyper::header::CACHE_CONTROL, "no-store");

    let response = match *req.method() {
        Method::GET => builder
            .status(StatusCode::OK)
            .body(Full::new(page.body.clone()).map_err(|never| match never {}).boxed()),
        Method::HEAD => builder
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_LENGTH, page.body.len())
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()),
        _ => Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .header(hyper::header::ALLOW, "GET, HEAD")
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()),
    };

    response.expect("valid response with static headers")
}
