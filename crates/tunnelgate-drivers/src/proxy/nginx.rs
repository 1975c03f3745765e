use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{ProxyDriver, ProxyError, RouteSpec};
use crate::exec;

const FILE_PREFIX: &str = "tunnelgate-";
const FILE_SUFFIX: &str = ".conf";

/// Render the nginx `server` block for one route.
///
/// Carries the standard forwarded headers and the `Upgrade`/`Connection` pair
/// so WebSocket and other upgraded protocols pass through.
pub fn render_server_block(route: &RouteSpec, listen_port: u16) -> String {
    format!(
        r#"# Managed by tunnelgate for tunnel {id}. Regenerated on change; do not edit.
server {{
    listen {listen};
    listen [::]:{listen};
    server_name {host};

    location / {{
        proxy_pass http://{target};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 3600s;
        proxy_buffering off;
    }}
}}
"#,
        id = route.tunnel_id,
        listen = listen_port,
        host = route.host,
        target = route.target,
    )
}

/// Writes nginx `server` blocks into a directory nginx includes, and reloads nginx
pub struct NginxDriver {
    routes_dir: PathBuf,
    reload_command: Vec<String>,
    listen_port: u16,
    timeout: Duration,
}

impl NginxDriver {
    /// `reload_command` is split on whitespace, e.g. `"nginx -s reload"`
    pub fn new(routes_dir: impl Into<PathBuf>, reload_command: &str, timeout: Duration) -> Self {
        Self {
            routes_dir: routes_dir.into(),
            reload_command: reload_command.split_whitespace().map(String::from).collect(),
            listen_port: 80,
            timeout,
        }
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn routes_dir(&self) -> &Path {
        &self.routes_dir
    }

    fn artifact_path(&self, tunnel_id: &str) -> PathBuf {
        self.routes_dir
            .join(format!("{}{}{}", FILE_PREFIX, tunnel_id, FILE_SUFFIX))
    }
}

#[async_trait]
impl ProxyDriver for NginxDriver {
    async fn write_route(&self, route: &RouteSpec) -> Result<(), ProxyError> {
        let path = self.artifact_path(&route.tunnel_id);
        let write_failed = |source| ProxyError::WriteFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.routes_dir)
            .await
            .map_err(write_failed)?;

        // Write-then-rename so nginx never includes a half-written file
        let staging = path.with_extension("conf.tmp");
        tokio::fs::write(&staging, render_server_block(route, self.listen_port))
            .await
            .map_err(write_failed)?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(write_failed)?;

        info!("Wrote route {} -> {} ({})", route.host, route.target, path.display());
        Ok(())
    }

    async fn remove_route(&self, tunnel_id: &str) -> Result<(), ProxyError> {
        let path = self.artifact_path(tunnel_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed route artifact {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Route artifact {} already absent", path.display());
                Ok(())
            }
            Err(source) => Err(ProxyError::RemoveFailed { path, source }),
        }
    }

    async fn list_routes(&self) -> Result<Vec<String>, ProxyError> {
        let mut entries = match tokio::fs::read_dir(&self.routes_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ProxyError::ListFailed {
                    path: self.routes_dir.clone(),
                    source,
                })
            }
        };

        let mut ids = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|source| ProxyError::ListFailed {
                    path: self.routes_dir.clone(),
                    source,
                })?;
            let Some(entry) = entry else { break };

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        let Some((program, args)) = self.reload_command.split_first() else {
            debug!("No reload command configured, skipping proxy reload");
            return Ok(());
        };

        exec::run(program, args, self.timeout)
            .await
            .map_err(ProxyError::ReloadFailed)?;

        info!("Reloaded reverse proxy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn route(id: &str) -> RouteSpec {
        RouteSpec {
            tunnel_id: id.to_string(),
            host: "alpha.example.com".to_string(),
            target: SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 2), 3000),
        }
    }

    #[test]
    fn test_server_block_routes_host_to_target() {
        let block = render_server_block(&route("t1"), 80);

        assert!(block.contains("server_name alpha.example.com;"));
        assert!(block.contains("proxy_pass http://10.8.0.2:3000;"));
        assert!(block.contains("listen 80;"));
    }

    #[test]
    fn test_server_block_supports_upgrade_and_forwarding() {
        let block = render_server_block(&route("t1"), 80);

        assert!(block.contains("proxy_http_version 1.1;"));
        assert!(block.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(block.contains("proxy_set_header Connection \"upgrade\";"));
        assert!(block.contains("X-Forwarded-For $proxy_add_x_forwarded_for"));
        assert!(block.contains("X-Forwarded-Proto $scheme"));
    }

    #[tokio::test]
    async fn test_write_list_remove_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NginxDriver::new(dir.path(), "", Duration::from_secs(1));

        driver.write_route(&route("t1")).await.unwrap();
        driver.write_route(&route("t2")).await.unwrap();
        std::fs::write(dir.path().join("default.conf"), "# unrelated").unwrap();

        assert_eq!(driver.list_routes().await.unwrap(), vec!["t1", "t2"]);

        driver.remove_route("t1").await.unwrap();
        assert_eq!(driver.list_routes().await.unwrap(), vec!["t2"]);
        assert!(dir.path().join("default.conf").exists());
    }

    #[tokio::test]
    async fn test_remove_absent_route_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NginxDriver::new(dir.path(), "", Duration::from_secs(1));

        assert!(driver.remove_route("never-written").await.is_ok());
        assert!(driver.remove_route("never-written").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NginxDriver::new(dir.path().join("missing"), "", Duration::from_secs(1));

        assert!(driver.list_routes().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_reload_is_reported_as_reload_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NginxDriver::new(dir.path(), "false", Duration::from_secs(5));

        let err = driver.reload().await.unwrap_err();
        assert!(matches!(err, ProxyError::ReloadFailed(_)));
    }
}
