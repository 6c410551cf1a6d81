//! Driver process launching
//!
//! The registry never spawns processes itself; it goes through a
//! [`Launcher`], which picks a transport by the manifest's declared
//! [`ProtocolKind`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use stepwise_common::{BoxedReader, BoxedWriter, DriverDescriptor, Error, ProtocolKind, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::DriverConfig;

/// Environment variable carrying the driver id
pub const ENV_DRIVER_ID: &str = "STEPWISE_DRIVER_ID";

/// Environment variable carrying the instance id
pub const ENV_INSTANCE_ID: &str = "STEPWISE_INSTANCE_ID";

/// Environment variable carrying the socket path for `unix` drivers
pub const ENV_SOCKET: &str = "STEPWISE_SOCKET";

/// A launched driver: its transport and, for real processes, the child
pub struct LaunchedDriver {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Option<DriverProcess>,
}

/// Starts driver instances
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, descriptor: &DriverDescriptor, instance_id: &str) -> Result<LaunchedDriver>;
}

/// Handle to a running driver process
#[derive(Debug)]
pub struct DriverProcess {
    driver_id: String,
    child: Child,
    socket: Option<PathBuf>,
}

impl DriverProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit description if the process has exited
    pub fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    /// Wait up to `within` for the process to exit on its own
    pub async fn wait_for_exit(&mut self, within: Duration) -> bool {
        tokio::time::timeout(within, self.child.wait()).await.is_ok()
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`
    pub async fn terminate(&mut self, grace: Duration) {
        if self.exit_status().is_some() {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && self.wait_for_exit(grace).await
                {
                    debug!(driver_id = %self.driver_id, pid, "Driver exited after SIGTERM");
                    return;
                }
            }
        }

        info!(driver_id = %self.driver_id, pid = ?self.child.id(), "Force killing driver process");
        if let Err(e) = self.child.kill().await {
            warn!(driver_id = %self.driver_id, "Failed to kill driver process: {}", e);
        }
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        if let Some(socket) = &self.socket {
            let _ = std::fs::remove_file(socket);
        }
    }
}

/// Launches drivers as child processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    socket_dir: PathBuf,
    connect_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            socket_dir: config.socket_dir(),
            connect_timeout: config.startup_timeout(),
        }
    }

    fn command(&self, descriptor: &DriverDescriptor, instance_id: &str) -> Command {
        let mut cmd = Command::new(&descriptor.executable);
        cmd.current_dir(&descriptor.root)
            .env(ENV_DRIVER_ID, &descriptor.id)
            .env(ENV_INSTANCE_ID, instance_id)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn(&self, cmd: &mut Command, descriptor: &DriverDescriptor) -> Result<Child> {
        cmd.spawn().map_err(|e| Error::DriverUnavailable {
            driver_id: descriptor.id.clone(),
            reason: format!("failed to spawn {}: {}", descriptor.executable.display(), e),
        })
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, descriptor: &DriverDescriptor, instance_id: &str) -> Result<LaunchedDriver> {
        info!(
            driver_id = %descriptor.id,
            instance_id,
            protocol = %descriptor.protocol,
            "Launching driver {}",
            descriptor.executable.display()
        );

        match descriptor.protocol {
            ProtocolKind::Stdio => {
                let mut cmd = self.command(descriptor, instance_id);
                cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
                let mut child = self.spawn(&mut cmd, descriptor)?;

                forward_output(&descriptor.id, "stderr", child.stderr.take());
                let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                    return Err(Error::DriverUnavailable {
                        driver_id: descriptor.id.clone(),
                        reason: "driver stdio was not captured".to_string(),
                    });
                };

                Ok(LaunchedDriver {
                    reader: Box::new(stdout),
                    writer: Box::new(stdin),
                    process: Some(DriverProcess {
                        driver_id: descriptor.id.clone(),
                        child,
                        socket: None,
                    }),
                })
            }
            #[cfg(unix)]
            ProtocolKind::Unix => {
                std::fs::create_dir_all(&self.socket_dir)?;
                let socket = self
                    .socket_dir
                    .join(format!("{}-{}.sock", descriptor.id, instance_id));
                if socket.exists() {
                    std::fs::remove_file(&socket)?;
                }

                let mut cmd = self.command(descriptor, instance_id);
                cmd.env(ENV_SOCKET, &socket)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped());
                let mut child = self.spawn(&mut cmd, descriptor)?;
                forward_output(&descriptor.id, "stderr", child.stderr.take());
                forward_output(&descriptor.id, "stdout", child.stdout.take());

                let mut process = DriverProcess {
                    driver_id: descriptor.id.clone(),
                    child,
                    socket: Some(socket.clone()),
                };

                match stepwise_common::protocol::connect_unix(&socket, self.connect_timeout).await {
                    Ok((reader, writer)) => Ok(LaunchedDriver {
                        reader,
                        writer,
                        process: Some(process),
                    }),
                    Err(e) => {
                        warn!(driver_id = %descriptor.id, "Driver socket never accepted: {}", e);
                        process.terminate(Duration::from_millis(500)).await;
                        Err(Error::DriverStartTimeout {
                            driver_id: descriptor.id.clone(),
                            millis: self.connect_timeout.as_millis() as u64,
                        })
                    }
                }
            }
            #[cfg(not(unix))]
            ProtocolKind::Unix => Err(Error::DriverUnavailable {
                driver_id: descriptor.id.clone(),
                reason: "unix socket drivers are not supported on this platform".to_string(),
            }),
        }
    }
}

/// Forward a child output stream into the log, line by line
fn forward_output<R>(driver_id: &str, stream: &'static str, output: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(output) = output else {
        return;
    };
    let driver_id = driver_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(driver_id = %driver_id, stream, "[driver] {}", line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;
    use stepwise_common::DriverClient;
    use tempfile::TempDir;

    fn script_descriptor(dir: &TempDir, body: &str) -> DriverDescriptor {
        let path = dir.path().join("driver.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        DriverDescriptor {
            id: "shell".to_string(),
            name: "Shell".to_string(),
            description: String::new(),
            version: String::new(),
            author: String::new(),
            license: String::new(),
            executable: path,
            protocol: ProtocolKind::Stdio,
            capabilities: BTreeSet::new(),
            actions: vec!["noop".to_string()],
            steps: vec![],
            category: String::new(),
            tags: vec![],
            root: dir.path().to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_stdio_driver_handshake() {
        let dir = TempDir::new().unwrap();
        let descriptor = script_descriptor(
            &dir,
            r#"echo '{"type":"event","method":"ready"}'
echo "starting $STEPWISE_DRIVER_ID" >&2
read line
sleep 1"#,
        );

        let launcher = ProcessLauncher::new(&DriverConfig::default());
        let launched = launcher.launch(&descriptor, "i-1").await.unwrap();
        let mut process = launched.process.unwrap();
        assert!(process.pid().is_some());

        let client = DriverClient::new("shell", launched.reader, launched.writer);
        client.wait_ready(Duration::from_secs(5)).await.unwrap();

        process.terminate(Duration::from_millis(200)).await;
        assert!(process.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut descriptor = script_descriptor(&dir, "true");
        descriptor.executable = dir.path().join("does-not-exist");

        let launcher = ProcessLauncher::new(&DriverConfig::default());
        let err = launcher.launch(&descriptor, "i-1").await.err().unwrap();
        assert_eq!(err.kind(), "DriverUnavailable");
    }
}
