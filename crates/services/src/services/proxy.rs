//! Edge proxy configuration.
//!
//! The routing table is a pure function of the running container set: every
//! change re-renders the whole document and atomically replaces the file the
//! proxy watches, then asks nginx to reload in place. Containers are
//! addressed by name over the internal network, so no host ports are ever
//! allocated.

use std::{io::Write, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),
    #[error("proxy reload failed: {0}")]
    Reload(String),
}

/// One route per running tenant container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub tenant: String,
    pub upstream: String,
    pub port: u16,
}

impl ProxyRoute {
    pub fn match_path(&self) -> String {
        format!("/preview/{}/", self.tenant)
    }
}

/// Render the complete proxy configuration for the given routes. Output is
/// deterministic (routes sorted by tenant) so repeated renders of the same
/// pool state are byte-identical.
pub fn render(routes: &[ProxyRoute]) -> String {
    let mut routes: Vec<&ProxyRoute> = routes.iter().collect();
    routes.sort_by(|a, b| a.tenant.cmp(&b.tenant));

    let mut doc = String::new();
    doc.push_str("# Generated sandbox routing table. Do not edit:\n");
    doc.push_str("# the whole file is replaced on every pool change.\n");
    doc.push_str("server {\n");
    doc.push_str("    listen 80;\n\n");
    // Docker's embedded DNS, re-resolved so container restarts are picked up.
    doc.push_str("    resolver 127.0.0.11 valid=10s;\n\n");
    doc.push_str("    location = /healthz {\n        return 200 'ok';\n    }\n");

    for route in routes {
        doc.push_str(&format!(
            r#"
    location {path} {{
        proxy_pass http://{upstream}:{port}/;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_read_timeout 86400;
    }}
"#,
            path = route.match_path(),
            upstream = route.upstream,
            port = route.port,
        ));
    }

    doc.push_str("\n    location /preview/ {\n        return 404;\n    }\n");
    doc.push_str("}\n");
    doc
}

pub struct ProxyController {
    conf_path: PathBuf,
}

impl ProxyController {
    pub fn new(conf_path: PathBuf) -> Self {
        Self { conf_path }
    }

    pub fn conf_path(&self) -> &PathBuf {
        &self.conf_path
    }

    /// Re-render the routing table, replace the config file, and reload the
    /// proxy. The file swap is atomic so the proxy never reads a half-written
    /// document.
    pub async fn sync(&self, routes: &[ProxyRoute]) -> Result<(), ProxyError> {
        let doc = render(routes);
        self.write_atomic(&doc)?;
        self.reload_or_start().await
    }

    fn write_atomic(&self, doc: &str) -> Result<(), ProxyError> {
        let parent = self
            .conf_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(doc.as_bytes())?;
        tmp.persist(&self.conf_path)?;
        Ok(())
    }

    /// `nginx -s reload` keeps in-flight connections on unrelated routes
    /// alive. If no instance is running, start one fresh.
    async fn reload_or_start(&self) -> Result<(), ProxyError> {
        if which::which("nginx").is_err() {
            tracing::warn!(
                "nginx not found on PATH; wrote {} without reloading",
                self.conf_path.display()
            );
            return Ok(());
        }

        let reload = tokio::process::Command::new("nginx")
            .args(["-s", "reload"])
            .output()
            .await?;
        if reload.status.success() {
            return Ok(());
        }

        tracing::info!("nginx reload failed, starting a fresh instance");
        let start = tokio::process::Command::new("nginx").output().await?;
        if start.status.success() {
            Ok(())
        } else {
            Err(ProxyError::Reload(
                String::from_utf8_lossy(&start.stderr).into_owned(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(tenant: &str) -> ProxyRoute {
        ProxyRoute {
            tenant: tenant.to_string(),
            upstream: format!("sbx_{tenant}"),
            port: 3000,
        }
    }

    #[test]
    fn rendered_routes_match_the_pool_exactly() {
        let doc = render(&[route("u1"), route("u2")]);
        assert!(doc.contains("location /preview/u1/"));
        assert!(doc.contains("proxy_pass http://sbx_u1:3000/;"));
        assert!(doc.contains("location /preview/u2/"));

        // Removing a route removes its block from the next render.
        let doc = render(&[route("u2")]);
        assert!(!doc.contains("/preview/u1/"));
        assert!(doc.contains("/preview/u2/"));
    }

    #[test]
    fn render_is_deterministic_regardless_of_input_order() {
        let forward = render(&[route("a"), route("b"), route("c")]);
        let reverse = render(&[route("c"), route("b"), route("a")]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn empty_pool_still_renders_a_valid_document() {
        let doc = render(&[]);
        assert!(doc.contains("server {"));
        assert!(doc.contains("location /preview/ {"));
        assert!(!doc.contains("proxy_pass"));
    }

    #[tokio::test]
    async fn sync_replaces_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("sbx-routes.conf");
        let controller = ProxyController::new(conf.clone());

        controller.sync(&[route("u1")]).await.unwrap();
        let first = std::fs::read_to_string(&conf).unwrap();
        assert!(first.contains("/preview/u1/"));

        controller.sync(&[route("u2")]).await.unwrap();
        let second = std::fs::read_to_string(&conf).unwrap();
        assert!(!second.contains("/preview/u1/"));
        assert!(second.contains("/preview/u2/"));
    }
}
