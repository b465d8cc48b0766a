use std::path::{Path, PathBuf};

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const CERT_FILE: &str = "tls.crt";
const KEY_FILE: &str = "tls.key";
/// Secret volumes swap this symlink instead of touching the files themselves.
const PROJECTED_DATA: &str = "..data";

/// Location of the serving certificate pair.
#[derive(Clone, Debug)]
pub struct CertPaths {
    dir: PathBuf,
}

impl CertPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub async fn load(&self) -> Result<RustlsConfig> {
        Ok(RustlsConfig::from_pem_file(self.cert(), self.key()).await?)
    }
}

fn touches_certificates(event: &Event) -> bool {
    event.paths.iter().any(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| matches!(name, CERT_FILE | KEY_FILE | PROJECTED_DATA))
    })
}

/// Reloads `config` in place whenever the certificate pair changes on disk.
///
/// A pair that fails to load leaves the previous one serving.
pub async fn reload_on_change(paths: CertPaths, config: RustlsConfig) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Err(e) = tx.blocking_send(res) {
                error!("Dropping certificate watch event: {}", e);
            }
        },
        Config::default(),
    )?;
    watcher.watch(paths.dir(), RecursiveMode::NonRecursive)?;
    info!("Watching {} for certificate rotation", paths.dir().display());

    while let Some(event) = rx.recv().await {
        match event {
            Ok(event) if touches_certificates(&event) => {
                match config.reload_from_pem_file(paths.cert(), paths.key()).await {
                    Ok(()) => info!("Reloaded serving certificate"),
                    Err(e) => warn!("Keeping previous certificate, reload failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Certificate watch error: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::EventKind;

    fn event(path: &str) -> Event {
        Event::new(EventKind::Any).add_path(PathBuf::from(path))
    }

    #[test]
    fn pair_lives_in_the_cert_dir() {
        let paths = CertPaths::new("/etc/certs");
        assert_eq!(paths.cert(), PathBuf::from("/etc/certs/tls.crt"));
        assert_eq!(paths.key(), PathBuf::from("/etc/certs/tls.key"));
    }

    #[test]
    fn only_certificate_changes_trigger_a_reload() {
        assert!(touches_certificates(&event("/etc/certs/tls.crt")));
        assert!(touches_certificates(&event("/etc/certs/..data")));
        assert!(!touches_certificates(&event("/etc/certs/ca.crt")));
    }
}
