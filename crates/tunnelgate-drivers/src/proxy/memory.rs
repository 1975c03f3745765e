use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ProxyDriver, ProxyError, RouteSpec};
use crate::exec::ExecError;

/// In-process stand-in for the reverse proxy
#[derive(Default)]
pub struct MemoryProxyDriver {
    routes: Mutex<BTreeMap<String, RouteSpec>>,
    reloads: AtomicUsize,
    fail_writes: AtomicBool,
    fail_reloads: AtomicBool,
    reload_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
}

impl MemoryProxyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, tunnel_id: &str) -> Option<RouteSpec> {
        self.routes.lock().unwrap().get(tunnel_id).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    /// Number of reloads that actually ran
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reloads(&self, fail: bool) {
        self.fail_reloads.store(fail, Ordering::SeqCst);
    }

    /// Make each reload take `delay`, to exercise coalescing
    pub fn set_reload_delay(&self, delay: Duration) {
        *self.reload_delay.lock().unwrap() = Some(delay);
    }

    /// Make each listing wait `delay` before reading the artifacts, like a
    /// slow directory scan
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Plant an artifact directly, bypassing the coordinator (simulates drift)
    pub fn insert_route(&self, route: RouteSpec) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.tunnel_id.clone(), route);
    }
}

#[async_trait]
impl ProxyDriver for MemoryProxyDriver {
    async fn write_route(&self, route: &RouteSpec) -> Result<(), ProxyError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ProxyError::WriteFailed {
                path: format!("memory://{}", route.tunnel_id).into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "simulated"),
            });
        }
        self.insert_route(route.clone());
        Ok(())
    }

    async fn remove_route(&self, tunnel_id: &str) -> Result<(), ProxyError> {
        self.routes.lock().unwrap().remove(tunnel_id);
        Ok(())
    }

    async fn list_routes(&self) -> Result<Vec<String>, ProxyError> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.routes.lock().unwrap().keys().cloned().collect())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        let delay = *self.reload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);

        if self.fail_reloads.load(Ordering::SeqCst) {
            return Err(ProxyError::ReloadFailed(ExecError::Failed {
                command: "nginx -s reload".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            }));
        }
        Ok(())
    }
}
