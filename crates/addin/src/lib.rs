//! Spill add-in runtime.
//!
//! The [`Addin`] context owns every piece of shared scheduler state. It is
//! built by the startup hook, injected into the entry point and the drain
//! loop, and torn down by the shutdown hook; nothing lives in statics.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use metrics::counter;
use spill_core::{Job, OwnedRange};
use spill_host::{FunctionSpec, HostValue, SheetHost};
use spill_inject::{FormulaTemplate, Injector};
use spill_sched::{spawn_drain, DedupCache, DrainHandle, JobQueue, Wakeup};
use tracing::{debug, info, warn};

/// Runtime configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AddinConfig {
    /// Formula rendered at each derived cell.
    pub template: FormulaTemplate,
    /// Item list used when the entry-point argument is absent or unusable.
    pub default_items: Vec<String>,
}

impl AddinConfig {
    /// `SPILL_FORMULA_TEMPLATE` overrides the injected formula (it must
    /// keep the `{item}` placeholder; invalid values fall back to the
    /// default). `SPILL_DEFAULT_ITEMS` is a comma-separated list.
    pub fn from_env() -> Self {
        let template = match std::env::var("SPILL_FORMULA_TEMPLATE") {
            Ok(s) => match FormulaTemplate::new(&s) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "invalid SPILL_FORMULA_TEMPLATE; using default");
                    FormulaTemplate::default()
                }
            },
            Err(_) => FormulaTemplate::default(),
        };
        let default_items = std::env::var("SPILL_DEFAULT_ITEMS")
            .ok()
            .map(|s| parse_item_list(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(builtin_default_items);
        Self { template, default_items }
    }
}

impl Default for AddinConfig {
    fn default() -> Self {
        Self { template: FormulaTemplate::default(), default_items: builtin_default_items() }
    }
}

fn builtin_default_items() -> Vec<String> {
    vec!["EUR".to_string(), "GBP".to_string()]
}

fn parse_item_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Registration metadata for the worksheet entry point.
pub fn function_spec() -> FunctionSpec {
    FunctionSpec {
        export: "SPILL".into(),
        name: "SPILL".into(),
        arg_name: "items".into(),
        category: "1".into(),
        help: "Materialize one formula row per item below this cell".into(),
        arg_help: "Optional: items (range/array/scalar). Default: EUR,GBP".into(),
    }
}

/// The add-in context: host handle, dedup cache, job queue, wakeup and the
/// running drain loop.
pub struct Addin {
    host: Arc<dyn SheetHost>,
    config: AddinConfig,
    dedup: DedupCache,
    queue: Arc<JobQueue>,
    wakeup: Wakeup,
    drain: Mutex<Option<DrainHandle>>,
}

impl Addin {
    /// Startup hook: register the entry point, create the wakeup endpoint,
    /// and spawn the drain loop on the current runtime.
    pub fn start(host: Arc<dyn SheetHost>, config: AddinConfig) -> Result<Arc<Self>> {
        host.register_function(&function_spec())
            .map_err(|e| anyhow!("registering entry point: {e}"))?;
        let queue = Arc::new(JobQueue::new());
        let wakeup = Wakeup::new();
        wakeup.ensure_endpoint();
        let injector = Injector::new(config.template.clone());
        let drain = spawn_drain(queue.clone(), &wakeup, host.clone(), injector);
        info!(template = config.template.as_str(), "add-in started");
        Ok(Arc::new(Self {
            host,
            config,
            dedup: DedupCache::new(),
            queue,
            wakeup,
            drain: Mutex::new(Some(drain)),
        }))
    }

    /// Worksheet entry point. Never blocks and never mutates the document;
    /// returns a stable empty text acknowledgment in every case. Accepted
    /// requests are queued for the drain loop and a wakeup is posted.
    pub fn on_request(&self, arg: &HostValue) -> HostValue {
        counter!("requests_total", 1u64);
        let ack = HostValue::Text(String::new());

        // The caller descriptor is a host temporary; the guard returns it
        // on every path out of this function.
        let caller = match self.host.calling_ref() {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "request outside evaluation ignored");
                return ack;
            }
        };
        let range = match caller.value().as_range() {
            Some(r) => r,
            None => {
                debug!("caller is not a range; request ignored");
                return ack;
            }
        };
        let anchor = match OwnedRange::try_copy(range) {
            Ok(a) => a,
            Err(e) => {
                debug!(error = %e, "unusable caller descriptor; request ignored");
                return ack;
            }
        };

        let items = self.parse_items(arg);
        let job = Job::new(anchor, items);
        if !self.dedup.should_accept(job.origin_key(), job.content_hash) {
            // Same origin, same items as last time. The job we just built
            // is dropped here, anchor included.
            return ack;
        }
        self.queue.enqueue(job);
        self.wakeup.request();
        counter!("requests_accepted_total", 1u64);
        ack
    }

    /// Parse the optional argument into an ordered item list. Absent or
    /// unusable input yields the configured default sequence.
    fn parse_items(&self, arg: &HostValue) -> Vec<String> {
        if arg.is_absent() {
            return self.config.default_items.clone();
        }
        let mut items = Vec::new();
        match arg {
            HostValue::Array { values, .. } => {
                items.reserve(values.len());
                for v in values {
                    if let Ok(s) = self.host.coerce_text(v) {
                        if !s.is_empty() {
                            items.push(s);
                        }
                    }
                }
            }
            scalar => {
                if let Ok(s) = self.host.coerce_text(scalar) {
                    if !s.is_empty() {
                        items.push(s);
                    }
                }
            }
        }
        if items.is_empty() {
            self.config.default_items.clone()
        } else {
            items
        }
    }

    /// Jobs accepted but not yet drained.
    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &AddinConfig {
        &self.config
    }

    /// Shutdown hook: stop the drain loop. Pending jobs are dropped and
    /// their anchors released without injection. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self.drain.lock().unwrap().take();
        if let Some(h) = handle {
            h.shutdown().await;
            info!("add-in stopped");
        }
    }
}
