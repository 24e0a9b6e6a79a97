use std::sync::Arc;

use tracing::{error, info};

use hookd::hooks::loader::ModuleLoader;
use hookd::hooks::registry::HookRegistry;
use hookd::hooks::watcher::HookWatcher;
use hookd::{Server, ServerConfig};

#[tokio::main]
async fn main() {
    hookd::tracing::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hookd.json".to_owned());
    let config = match ServerConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(error) => {
            error!(path = %config_path, %error, "configuration rejected");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(HookRegistry::new());
    let loader = Arc::new(ModuleLoader::new(
        registry.clone(),
        config.basedir.clone(),
        config.watch_recursive,
    ));
    let server = Arc::new(Server::new(config, registry));

    let modules = loader.scan();
    info!(modules, "initial hook module scan complete");

    let _watcher = match HookWatcher::spawn(loader, server.executor().clone()) {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            error!(%error, "module watcher failed to start; hot reload disabled");
            None
        }
    };

    if let Err(error) = hookd::serve(server).await {
        error!(%error, "server terminated");
        std::process::exit(1);
    }
}
