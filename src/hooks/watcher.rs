//! Filesystem watcher driving hot reload of hook modules.
//!
//! Raw notify events are forwarded into a tokio channel; the reload task
//! coalesces them over a 200 ms quiescence window (a batch flushes only
//! after the directory has been quiet that long), reloads each changed
//! module once, and then fires the built-in `onHookModuleChanged` event
//! hook with the absolute path of every module in the batch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collections::RingQueue;

use super::executor::Executor;
use super::loader::{is_module_path, ModuleLoader};
use super::{HookArgs, MatchMode, ALL_CATEGORIES, MODULE_CHANGED_HOOK};

/// Quiescence window for coalescing filesystem events into one reload
/// batch.
const QUIESCENCE: Duration = Duration::from_millis(200);

/// Running watcher; dropping it stops event delivery.
pub struct HookWatcher {
    _watcher: RecommendedWatcher,
}

impl HookWatcher {
    /// Starts watching the loader's base directory and spawns the reload
    /// task.
    pub fn spawn(loader: Arc<ModuleLoader>, executor: Executor) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let _ = tx.send(event);
            })?;
        let mode = if loader.recursive() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(loader.basedir(), mode)?;
        info!(
            basedir = %loader.basedir().display(),
            recursive = loader.recursive(),
            "watching hook modules"
        );

        tokio::spawn(reload_loop(rx, loader, executor));
        Ok(Self { _watcher: watcher })
    }
}

async fn reload_loop(
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    loader: Arc<ModuleLoader>,
    executor: Executor,
) {
    let mut pending = RingQueue::new();
    let mut seen = HashSet::new();

    loop {
        let event = if pending.is_empty() {
            match rx.recv().await {
                Some(event) => event,
                None => break,
            }
        } else {
            match tokio::time::timeout(QUIESCENCE, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    flush(&mut pending, &mut seen, &loader, &executor);
                    break;
                }
                Err(_) => {
                    flush(&mut pending, &mut seen, &loader, &executor);
                    continue;
                }
            }
        };

        match event {
            Ok(event) => {
                for path in event.paths {
                    if !is_module_path(&path) {
                        continue;
                    }
                    let path = absolute(path);
                    if seen.insert(path.clone()) {
                        pending.push_back(path);
                    }
                }
            }
            Err(error) => warn!(%error, "filesystem watcher error"),
        }
    }
}

fn flush(
    pending: &mut RingQueue<PathBuf>,
    seen: &mut HashSet<PathBuf>,
    loader: &ModuleLoader,
    executor: &Executor,
) {
    let batch = pending.drain();
    seen.clear();
    if batch.is_empty() {
        return;
    }
    debug!(modules = batch.len(), "reloading hook module batch");

    for path in &batch {
        loader.reload_path(path);
    }
    for path in batch {
        executor.dispatch(
            MODULE_CHANGED_HOOK,
            ALL_CATEGORIES,
            MatchMode::Inclusive,
            HookArgs::ModuleChanged { path },
        );
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::registry::HookRegistry;
    use std::io::Write;

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn reloads_on_module_change() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HookRegistry::new());
        let loader = Arc::new(ModuleLoader::new(
            registry.clone(),
            dir.path().to_owned(),
            false,
        ));
        let executor = Executor::new(registry.clone(), false);
        let _watcher = HookWatcher::spawn(loader, executor).unwrap();

        let path = dir.path().join("fresh.hook.lua");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(
                br#"return { ["hS_fresh$"] = function() return { status = 200 } end }"#,
            )
            .unwrap();
        }

        let probe = registry.clone();
        wait_for("module load", move || {
            probe.check_target("fresh$", ALL_CATEGORIES, MatchMode::Inclusive)
        })
        .await;

        std::fs::remove_file(&path).unwrap();
        let probe = registry.clone();
        wait_for("module removal", move || {
            !probe.check_target("fresh$", ALL_CATEGORIES, MatchMode::Inclusive)
        })
        .await;
    }

    #[tokio::test]
    async fn fires_module_changed_event() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(HookRegistry::new());
        let loader = Arc::new(ModuleLoader::new(
            registry.clone(),
            dir.path().to_owned(),
            false,
        ));
        let executor = Executor::new(registry.clone(), false);

        // subscriber that records the changed-module paths it is given
        let paths = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let paths_in_hook = paths.clone();
        let parsed = crate::hooks::decode_name("hE_onHookModuleChanged").unwrap();
        let handler: crate::hooks::HookHandler = Arc::new(move |args, _cont| {
            let paths = paths_in_hook.clone();
            Box::pin(async move {
                if let HookArgs::ModuleChanged { path } = args {
                    paths.lock().push(path);
                }
                Ok(None)
            })
        });
        registry.install(vec![crate::hooks::HookFunction::new(
            "builtin",
            parsed,
            0,
            handler,
        )]);

        let _watcher = HookWatcher::spawn(loader, executor).unwrap();

        let path = dir.path().join("evt.hook.lua");
        std::fs::write(&path, br#"return { ["hS_evt$"] = function() end }"#).unwrap();

        let probe = paths.clone();
        wait_for("event hook", move || !probe.lock().is_empty()).await;
        let recorded = paths.lock();
        assert!(recorded[0].is_absolute());
        assert!(recorded[0].ends_with("evt.hook.lua"));
    }
}
