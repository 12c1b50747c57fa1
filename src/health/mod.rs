use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthSnapshot {
    /// One-line rendering for chat replies.
    pub fn summary(&self) -> String {
        let mut line = format!("uptime: {}s", self.uptime_seconds);
        for (name, component) in &self.components {
            let _ = write!(line, "; {name}: {}", component.status);
            if let Some(ref err) = component.last_error {
                let _ = write!(line, " ({err})");
            }
        }
        line
    }
}

/// Per-runtime component health, shared by the supervisor and the tasks it runs.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started_at: Instant::now(),
                components: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn upsert_component<F>(&self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentHealth),
    {
        let mut map = self.inner.components.lock();
        let now = now_rfc3339();
        let entry = map
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                status: "starting".into(),
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
            });
        update(entry);
        entry.updated_at = now;
    }

    pub fn mark_component_ok(&self, component: &str) {
        self.upsert_component(component, |entry| {
            entry.status = "ok".into();
            entry.last_ok = Some(now_rfc3339());
            entry.last_error = None;
        });
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn mark_component_error(&self, component: &str, error: impl ToString) {
        let err = error.to_string();
        self.upsert_component(component, move |entry| {
            entry.status = "error".into();
            entry.last_error = Some(err);
        });
    }

    pub fn mark_component_stopped(&self, component: &str) {
        self.upsert_component(component, |entry| {
            entry.status = "stopped".into();
        });
    }

    pub fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.inner.components.lock().get(component).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components = self.inner.components.lock().clone();

        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.inner.started_at.elapsed().as_secs(),
            components,
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "message": "failed to serialize health snapshot"
            })
        })
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
