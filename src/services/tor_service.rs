//! Tor daemon lifecycle and hidden-service publication.
//!
//! Locates a `tor` binary, launches it with a hidden service pointing at the
//! local chat server, and waits for the daemon to write the onion hostname.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use super::config::TorSettings;
use crate::error::{Result, TorlineError};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(unix)]
const STOP_GRACE: Duration = Duration::from_secs(5);

#[cfg(windows)]
const TOR_EXE: &str = "tor.exe";
#[cfg(not(windows))]
const TOR_EXE: &str = "tor";

pub struct TorService {
    settings: TorSettings,
    /// Port of the local chat server the hidden service forwards to.
    local_port: u16,
    child: Option<Child>,
    onion_address: Option<String>,
    hidden_service_dir: Option<PathBuf>,
}

impl TorService {
    pub fn new(settings: TorSettings, local_port: u16) -> Self {
        Self {
            settings,
            local_port,
            child: None,
            onion_address: None,
            hidden_service_dir: None,
        }
    }

    /// Launch Tor and wait for the hidden service address.
    pub async fn start(&mut self) -> Result<String> {
        if let Some(addr) = &self.onion_address {
            return Ok(addr.clone());
        }

        let binary = self.find_tor_binary()?;
        let version = verify_binary(&binary).await?;
        log::info!("Using Tor at {} ({})", binary.display(), version);

        let hs_dir = self.resolve_hidden_service_dir()?;
        let data_dir = hs_dir
            .parent()
            .map(|p| p.join("data"))
            .unwrap_or_else(|| PathBuf::from("data"));
        std::fs::create_dir_all(&data_dir)?;

        let hs_port = format!(
            "{} 127.0.0.1:{}",
            self.settings.hidden_service_port, self.local_port
        );
        log::info!(
            "Starting Tor: SocksPort {}, ControlPort {}, HiddenServiceDir {}",
            self.settings.socks_port,
            self.settings.control_port,
            hs_dir.display()
        );

        let mut child = Command::new(&binary)
            .arg("--SocksPort")
            .arg(self.settings.socks_port.to_string())
            .arg("--ControlPort")
            .arg(self.settings.control_port.to_string())
            .arg("--DataDirectory")
            .arg(&data_dir)
            .arg("--HiddenServiceDir")
            .arg(&hs_dir)
            .arg("--HiddenServicePort")
            .arg(&hs_port)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TorlineError::TransportUnavailable(format!("Failed to start Tor: {}", e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        match self.wait_for_hostname(&mut child, &hs_dir).await {
            Ok(address) => {
                log::info!("Hidden service available at {}", address);
                self.child = Some(child);
                self.hidden_service_dir = Some(hs_dir);
                self.onion_address = Some(address.clone());
                Ok(address)
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }

    async fn wait_for_hostname(&self, child: &mut Child, hs_dir: &Path) -> Result<String> {
        let hostname_file = hs_dir.join("hostname");
        for attempt in 1..=self.settings.startup_attempts {
            if let Some(status) = child.try_wait()? {
                return Err(TorlineError::TransportUnavailable(format!(
                    "Tor exited during startup ({})",
                    status
                )));
            }
            if let Ok(contents) = tokio::fs::read_to_string(&hostname_file).await {
                let address = contents.trim();
                if !address.is_empty() {
                    return Ok(address.to_string());
                }
            }
            log::debug!(
                "Waiting for hidden service hostname ({}/{})",
                attempt,
                self.settings.startup_attempts
            );
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
        Err(TorlineError::TransportUnavailable(format!(
            "Hidden service hostname not published after {} attempts",
            self.settings.startup_attempts
        )))
    }

    /// Terminate the daemon. The hidden service directory (and so the onion
    /// address) is kept for the next start.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.onion_address = None;

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
                    log::info!("Tor stopped");
                    return;
                }
            }
        }

        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill Tor: {}", e);
        }
        log::info!("Tor stopped");
    }

    pub fn onion_address(&self) -> Option<&str> {
        self.onion_address.as_deref()
    }

    pub fn hidden_service_dir(&self) -> Option<&Path> {
        self.hidden_service_dir.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn socks_proxy_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.settings.socks_port)
    }

    /// Configured path, then `PATH`, then well-known install locations.
    pub fn find_tor_binary(&self) -> Result<PathBuf> {
        if let Some(configured) = &self.settings.binary {
            if is_executable(configured) {
                return Ok(configured.clone());
            }
            return Err(TorlineError::TransportUnavailable(format!(
                "Configured Tor binary {} is missing or not executable",
                configured.display()
            )));
        }

        search_path(std::env::var_os("PATH"))
            .or_else(|| default_locations().into_iter().find(|p| is_executable(p)))
            .ok_or_else(|| {
                TorlineError::TransportUnavailable(
                    "Tor is not installed. Install it or set tor.binary in the config."
                        .to_string(),
                )
            })
    }

    /// Reuse a directory that already holds a hostname; otherwise create the
    /// primary one with owner-only permissions.
    ///
    /// A configured directory replaces the default candidates entirely.
    pub fn resolve_hidden_service_dir(&self) -> Result<PathBuf> {
        let candidates = match &self.settings.hidden_service_dir {
            Some(dir) => vec![dir.clone()],
            None => default_hidden_service_dirs(),
        };

        if let Some(existing) = candidates.iter().find(|d| d.join("hostname").is_file()) {
            log::info!("Reusing hidden service directory {}", existing.display());
            return Ok(existing.clone());
        }

        let primary = candidates.into_iter().next().ok_or_else(|| {
            TorlineError::TransportUnavailable("No hidden service directory available".into())
        })?;
        std::fs::create_dir_all(&primary)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&primary, std::fs::Permissions::from_mode(0o700))?;
        }
        log::info!("Created hidden service directory {}", primary.display());
        Ok(primary)
    }
}

/// Run `tor --version` and return its first output line.
pub async fn verify_binary(binary: &Path) -> Result<String> {
    let version_check = Command::new(binary)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(VERSION_CHECK_TIMEOUT, version_check)
        .await
        .map_err(|_| {
            TorlineError::TransportUnavailable(format!(
                "{} --version timed out",
                binary.display()
            ))
        })?
        .map_err(|e| {
            TorlineError::TransportUnavailable(format!("Failed to run {}: {}", binary.display(), e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TorlineError::TransportUnavailable(format!(
            "{} --version failed: {}",
            binary.display(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string())
}

async fn forward_output<R>(stream: R, name: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("[tor {}] {}", name, line);
    }
}

fn search_path(path_var: Option<OsString>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(TOR_EXE))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_hidden_service_dirs() -> Vec<PathBuf> {
    vec![
        home_dir().join(".tor").join("hidden_service"),
        PathBuf::from("hidden_service"),
    ]
}

#[cfg(target_os = "linux")]
fn default_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/bin/tor"),
        PathBuf::from("/usr/local/bin/tor"),
        PathBuf::from("/opt/tor/tor"),
        home_dir().join("tor").join("tor"),
        PathBuf::from("./tor"),
    ]
}

#[cfg(target_os = "macos")]
fn default_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/Applications/Tor Browser.app/Contents/MacOS/Tor/tor"),
        PathBuf::from("/Applications/TorBrowser.app/Contents/MacOS/Tor/tor"),
        PathBuf::from("/usr/local/bin/tor"),
        PathBuf::from("/opt/homebrew/bin/tor"),
        home_dir().join("tor").join("tor"),
        PathBuf::from("./tor"),
    ]
}

#[cfg(windows)]
fn default_locations() -> Vec<PathBuf> {
    let home = home_dir();
    vec![
        home.join("Desktop")
            .join("Tor Browser")
            .join("Browser")
            .join("TorBrowser")
            .join("Tor")
            .join("tor.exe"),
        PathBuf::from(r"C:\Program Files\Tor Browser\Browser\TorBrowser\Tor\tor.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Tor Browser\Browser\TorBrowser\Tor\tor.exe"),
        PathBuf::from(r"C:\Program Files\Tor\tor.exe"),
        PathBuf::from(r"C:\Tor\tor.exe"),
        PathBuf::from("tor.exe"),
    ]
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn default_locations() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin/tor"),
        PathBuf::from("/usr/bin/tor"),
        PathBuf::from("./tor"),
    ]
}
