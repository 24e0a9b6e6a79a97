//! Lua hook-module loading.
//!
//! A hook module is a file named `*.hook.lua` whose chunk evaluates to a
//! table. Table entries whose key parses per the naming grammar and whose
//! value is a function become hook functions; the reserved keys
//! `default_priority` (number) and `priorities` (table keyed by export
//! name) carry the module-wide and per-function priorities. Anything else
//! is ignored.
//!
//! Every module runs in its own Lua VM, kept alive by the handlers that
//! reference it and replaced wholesale on reload. Script calls are
//! synchronous Lua; the handler wrapper runs them on the blocking pool so
//! the request executor never stalls.
//!
//! Loading errors are non-fatal: the module contributes zero functions and
//! a warning is logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use mlua::{Lua, MultiValue, RegistryKey, Table, UserData, UserDataMethods, Value};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::{Payload, ResponseDescriptor, DEFAULT_MAX_AGE};
use crate::error::ModuleError;

use super::executor::Continuation;
use super::registry::HookRegistry;
use super::{decode_name, HookArgs, HookFunction, HookHandler, HookOutput};

/// Filename suffix identifying hook modules.
pub const MODULE_SUFFIX: &str = ".hook.lua";

/// Reserved module-table key: numeric default priority for the module.
const KEY_DEFAULT_PRIORITY: &str = "default_priority";
/// Reserved module-table key: per-function priority table.
const KEY_PRIORITIES: &str = "priorities";

type SharedVm = Arc<Mutex<Lua>>;

/// Discovers, loads, and reloads hook modules under a base directory.
pub struct ModuleLoader {
    registry: Arc<HookRegistry>,
    basedir: PathBuf,
    recursive: bool,
}

impl ModuleLoader {
    pub fn new(registry: Arc<HookRegistry>, basedir: PathBuf, recursive: bool) -> Self {
        Self {
            registry,
            basedir,
            recursive,
        }
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Initial scan: loads every module under the base directory. Returns
    /// the number of modules that contributed functions.
    pub fn scan(&self) -> usize {
        let mut paths = Vec::new();
        collect_modules(&self.basedir, self.recursive, &mut paths);
        let mut loaded = 0;
        for path in paths {
            if self.reload_path(&path) {
                loaded += 1;
            }
        }
        loaded
    }

    /// Loads or reloads one module path; a deleted file removes the
    /// module's functions. Returns whether the module now contributes any
    /// functions.
    pub fn reload_path(&self, path: &Path) -> bool {
        let source = module_source(path);
        if !path.exists() {
            info!(module = %source, "hook module removed");
            self.registry.remove_source(&source);
            return false;
        }
        match load_module(path, &source) {
            Ok(functions) => {
                let count = functions.len();
                self.registry.replace_module(&source, functions);
                debug!(module = %source, functions = count, "hook module loaded");
                count > 0
            }
            Err(error) => {
                warn!(module = %source, %error, "hook module failed to load");
                self.registry.replace_module(&source, Vec::new());
                false
            }
        }
    }
}

/// Module identifier: the file's basename.
pub fn module_source(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Whether a path names a hook module.
pub fn is_module_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(MODULE_SUFFIX))
        .unwrap_or(false)
}

fn collect_modules(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(dir = %dir.display(), %error, "unable to read hook module directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                collect_modules(&path, true, out);
            }
        } else if is_module_path(&path) {
            out.push(path);
        }
    }
    out.sort();
}

fn load_module(path: &Path, source: &str) -> Result<Vec<HookFunction>, ModuleError> {
    let code = std::fs::read_to_string(path).map_err(|e| ModuleError::Read {
        path: path.to_owned(),
        source: e,
    })?;

    let lua = Lua::new();
    let chunk_name = path.display().to_string();
    let evaluated: Value = lua
        .load(&code)
        .set_name(chunk_name)
        .eval()
        .map_err(|e| ModuleError::Eval {
            path: path.to_owned(),
            source: e,
        })?;
    let module = match evaluated {
        Value::Table(table) => table,
        _ => {
            return Err(ModuleError::NotATable {
                path: path.to_owned(),
            })
        }
    };

    let default_priority: i64 = read_integer(&module, KEY_DEFAULT_PRIORITY).unwrap_or(0);
    let priorities: Option<Table> = module.get(KEY_PRIORITIES).ok().flatten();

    let mut exports = Vec::new();
    for pair in module.clone().pairs::<Value, Value>() {
        let (key, value) = match pair {
            Ok(pair) => pair,
            Err(error) => {
                warn!(module = %source, %error, "skipping unreadable module entry");
                continue;
            }
        };
        let (name, function) = match (key, value) {
            (Value::String(name), Value::Function(function)) => {
                (lossy_string(&name), function)
            }
            _ => continue,
        };
        let Some(parsed) = decode_name(&name) else {
            continue;
        };
        let priority = priorities
            .as_ref()
            .and_then(|t| read_integer(t, &name))
            .unwrap_or(default_priority);
        exports.push((name, parsed, priority, function));
    }

    let vm: SharedVm = Arc::new(Mutex::new(lua));
    let mut functions = Vec::with_capacity(exports.len());
    for (export, parsed, priority, function) in exports {
        let key = {
            let lua = vm.lock();
            match lua.create_registry_value(function) {
                Ok(key) => Arc::new(key),
                Err(error) => {
                    warn!(module = %source, export = %export, %error, "unable to pin hook function");
                    continue;
                }
            }
        };
        let handler = script_handler(vm.clone(), key, source.to_owned(), export);
        functions.push(HookFunction::new(source, parsed, priority, handler));
    }
    Ok(functions)
}

fn read_integer(table: &Table, key: &str) -> Option<i64> {
    match table.get::<Value>(key) {
        Ok(Value::Integer(i)) => Some(i),
        Ok(Value::Number(n)) => Some(n as i64),
        _ => None,
    }
}

fn lossy_string(s: &mlua::String) -> String {
    String::from_utf8_lossy(&s.as_bytes()).into_owned()
}

/// Wraps a pinned Lua function into a native hook handler. The call runs on
/// the blocking pool under the module VM's lock; for ASYNC hooks the
/// returned value resumes the continuation unless the script already did so
/// through its flow handle.
fn script_handler(
    vm: SharedVm,
    key: Arc<RegistryKey>,
    source: String,
    export: String,
) -> HookHandler {
    Arc::new(move |args: HookArgs, cont: Option<Continuation>| {
        let vm = vm.clone();
        let key = key.clone();
        let source = source.clone();
        let export = export.clone();
        Box::pin(async move {
            let label = format!("{source}:{export}");
            let cont_for_call = cont.clone();
            let output = tokio::task::spawn_blocking(move || {
                call_script(&vm, &key, &args, cont_for_call)
            })
            .await
            .map_err(|e| anyhow!("hook {label} task failed: {e}"))?
            .with_context(|| format!("hook {label}"))?;

            match cont {
                Some(cont) => {
                    // explicit flow:resume() wins; this is a no-op then
                    cont.resume(output);
                    Ok(None)
                }
                None => Ok(output),
            }
        })
    })
}

fn call_script(
    vm: &Mutex<Lua>,
    key: &RegistryKey,
    args: &HookArgs,
    cont: Option<Continuation>,
) -> anyhow::Result<HookOutput> {
    let lua = vm.lock();
    let function: mlua::Function = lua
        .registry_value(key)
        .map_err(|e| anyhow!("stale hook function: {e}"))?;
    let call_args = args_to_lua(&lua, args, cont).map_err(|e| anyhow!("argument marshalling: {e}"))?;
    let returned: Value = function
        .call(call_args)
        .map_err(|e| anyhow!("{e}"))?;
    descriptor_from_lua(returned)
}

/// Flow handle passed as the trailing argument of ASYNC hooks; `resume`
/// completes the suspension early.
struct FlowHandle(Continuation);

impl UserData for FlowHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("resume", |_lua, this, value: Value| {
            let output = descriptor_from_lua(value)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            this.0.resume(output);
            Ok(())
        });
    }
}

/// Responder handle passed to manual-mode delegates; `send` transmits the
/// final response descriptor.
struct LuaResponder(super::executor::RespondHandle);

impl UserData for LuaResponder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("send", |_lua, this, value: Value| {
            let output = descriptor_from_lua(value)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            match output {
                Some(descriptor) => Ok(this.0.send(descriptor)),
                None => Err(mlua::Error::RuntimeError(
                    "respond:send expects a descriptor table".into(),
                )),
            }
        });
    }
}

fn args_to_lua(
    lua: &Lua,
    args: &HookArgs,
    cont: Option<Continuation>,
) -> mlua::Result<MultiValue> {
    let mut values = Vec::new();
    match args {
        HookArgs::Request(request) => {
            if let Some(path) = &request.path {
                values.push(Value::String(lua.create_string(path.as_bytes())?));
            }
            values.push(Value::Table(string_map_to_lua(lua, &request.params)?));
            values.push(Value::Table(headers_to_lua(lua, &request.headers)?));
            values.push(Value::String(lua.create_string(&request.body[..])?));
        }
        HookArgs::ModuleChanged { path } => {
            let path = path.display().to_string();
            values.push(Value::String(lua.create_string(path.as_bytes())?));
        }
        HookArgs::Manual(manual) => {
            let request = lua.create_table()?;
            request.set("method", manual.request.method.as_str())?;
            request.set("target", manual.request.target.as_str())?;
            request.set("headers", headers_to_lua(lua, &manual.request.headers)?)?;
            values.push(Value::Table(request));
            values.push(Value::UserData(
                lua.create_userdata(LuaResponder(manual.respond.clone()))?,
            ));
            values.push(Value::Table(descriptor_to_lua(lua, &manual.descriptor)?));
        }
    }
    if let Some(cont) = cont {
        values.push(Value::UserData(lua.create_userdata(FlowHandle(cont))?));
    }
    Ok(MultiValue::from_vec(values))
}

fn string_map_to_lua(
    lua: &Lua,
    map: &std::collections::HashMap<String, String>,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (k, v) in map {
        table.set(k.as_str(), v.as_str())?;
    }
    Ok(table)
}

fn headers_to_lua(lua: &Lua, headers: &http::HeaderMap) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (name, value) in headers {
        table.set(name.as_str(), lua.create_string(value.as_bytes())?)?;
    }
    Ok(table)
}

fn descriptor_to_lua(lua: &Lua, descriptor: &ResponseDescriptor) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    if let Some(status) = descriptor.status {
        table.set("status", status)?;
    }
    match &descriptor.data {
        Payload::Bytes(bytes) => table.set("data", lua.create_string(&bytes[..])?)?,
        Payload::Text(text) => table.set("data", lua.create_string(text.as_bytes())?)?,
        Payload::Stream(_) | Payload::None => {}
    }
    if let Some(data_type) = &descriptor.data_type {
        table.set("type", data_type.as_str())?;
    }
    if let Some(length) = descriptor.data_length {
        table.set("length", length)?;
    }
    if !descriptor.headers.is_empty() {
        let headers = lua.create_table()?;
        for (name, value) in &descriptor.headers {
            headers.set(name.as_str(), value.as_str())?;
        }
        table.set("headers", headers)?;
    }
    if let Some(etag) = &descriptor.entity_tag {
        table.set("etag", etag.as_str())?;
    }
    match descriptor.max_age {
        Some(age) => table.set("maxage", age)?,
        None => table.set("maxage", false)?,
    }
    if let Some(manual) = &descriptor.manual {
        table.set("manual", manual.as_str())?;
    }
    if descriptor.error {
        table.set("error", true)?;
    }
    Ok(table)
}

/// Converts a hook's return value into a descriptor. `nil` means the hook
/// produced nothing; a table is decoded field by field; any other value is
/// rejected.
fn descriptor_from_lua(value: Value) -> anyhow::Result<HookOutput> {
    let table = match value {
        Value::Nil => return Ok(None),
        Value::Table(table) => table,
        other => {
            return Err(anyhow!(
                "hook returned {} instead of a descriptor table",
                other.type_name()
            ))
        }
    };

    let mut descriptor = ResponseDescriptor::default();

    descriptor.status = match table.get::<Value>("status") {
        Ok(Value::Integer(i)) => u16::try_from(i).ok(),
        Ok(Value::Number(n)) => u16::try_from(n as i64).ok(),
        _ => None,
    };

    descriptor.data = match table.get::<Value>("data") {
        Ok(Value::String(s)) => Payload::Bytes(Bytes::copy_from_slice(&s.as_bytes())),
        _ => Payload::None,
    };

    if let Ok(Value::String(s)) = table.get::<Value>("type") {
        descriptor.data_type = Some(lossy_string(&s));
    }

    descriptor.data_length = match table.get::<Value>("length") {
        Ok(Value::Integer(i)) if i >= 0 => Some(i as u64),
        Ok(Value::Number(n)) if n >= 0.0 => Some(n as u64),
        _ => None,
    };

    if let Ok(Value::Table(headers)) = table.get::<Value>("headers") {
        for pair in headers.pairs::<Value, Value>() {
            let Ok((Value::String(name), value)) = pair else {
                continue;
            };
            let value = match value {
                Value::String(s) => lossy_string(&s),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            descriptor.headers.push((lossy_string(&name), value));
        }
    }

    if let Ok(Value::String(s)) = table.get::<Value>("etag") {
        descriptor.entity_tag = Some(lossy_string(&s));
    }

    descriptor.max_age = match table.get::<Value>("maxage") {
        Ok(Value::Integer(i)) if i >= 0 => Some(i as u64),
        Ok(Value::Number(n)) if n >= 0.0 => Some(n as u64),
        Ok(Value::Nil) => Some(DEFAULT_MAX_AGE),
        _ => None,
    };

    if let Ok(Value::String(s)) = table.get::<Value>("manual") {
        descriptor.manual = Some(lossy_string(&s));
    }

    descriptor.error = matches!(table.get::<Value>("error"), Ok(Value::Boolean(true)));

    Ok(Some(descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{ExecPolicy, MatchMode, ALL_CATEGORIES};
    use std::io::Write;

    fn write_module(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    fn loader_for(dir: &Path) -> (Arc<HookRegistry>, ModuleLoader) {
        let registry = Arc::new(HookRegistry::new());
        let loader = ModuleLoader::new(registry.clone(), dir.to_owned(), false);
        (registry, loader)
    }

    #[test]
    fn scan_loads_exports_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_module(
            dir.path(),
            "site.hook.lua",
            r#"
            return {
                default_priority = 10,
                priorities = { ["hSA_www.example$"] = -3 },
                ["hSA_www.example$"] = function(params, headers, body)
                    return { status = 200, data = "index", type = "text/plain" }
                end,
                ["hEB_www.example$log"] = function(params, headers, body) end,
                helper = function() end,
                note = "not a hook",
            }
            "#,
        );
        let (registry, loader) = loader_for(dir.path());
        assert_eq!(loader.scan(), 1);

        let chain = registry.chain("www.example$").unwrap();
        assert_eq!(chain.len(), 1);
        let f = &chain.functions()[0];
        assert_eq!(f.source, "site.hook.lua");
        assert_eq!(f.policy, ExecPolicy::Sync);
        assert_eq!(f.mask, 0b001);
        assert_eq!(f.priority, -3, "priorities table overrides the default");

        let log = registry.chain("www.example$log").unwrap();
        assert_eq!(log.functions()[0].priority, 10, "module default applies");
        assert_eq!(log.functions()[0].policy, ExecPolicy::Event);

        assert!(registry.chain("helper").is_none(), "non-grammar keys ignored");
    }

    #[test]
    fn broken_module_contributes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "bad.hook.lua", "this is not lua at all ((");
        write_module(
            dir.path(),
            "good.hook.lua",
            r#"return { ["hS_ok"] = function() return { status = 204 } end }"#,
        );
        let (registry, loader) = loader_for(dir.path());
        assert_eq!(loader.scan(), 1, "only the good module loads");
        assert!(registry.check_target("ok", ALL_CATEGORIES, MatchMode::Inclusive));
    }

    #[test]
    fn non_table_module_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path(), "scalar.hook.lua", "return 42");
        let err = load_module(&path, "scalar.hook.lua").unwrap_err();
        assert!(matches!(err, ModuleError::NotATable { .. }));
    }

    #[test]
    fn deleted_module_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(
            dir.path(),
            "gone.hook.lua",
            r#"return { ["hS_page"] = function() return { status = 200 } end }"#,
        );
        let (registry, loader) = loader_for(dir.path());
        loader.scan();
        assert!(registry.check_target("page", ALL_CATEGORIES, MatchMode::Inclusive));

        std::fs::remove_file(&path).unwrap();
        loader.reload_path(&path);
        assert!(!registry.check_target("page", ALL_CATEGORIES, MatchMode::Inclusive));
        assert!(registry.chain("page").is_some(), "empty chain remains");
    }

    #[tokio::test]
    async fn script_hook_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_module(
            dir.path(),
            "echo.hook.lua",
            r#"
            return {
                ["hS_echo$"] = function(params, headers, body)
                    return {
                        status = 200,
                        data = "name=" .. (params.name or "?") .. " body=" .. body,
                        type = "text/plain",
                        etag = headers["x-tag"],
                        maxage = 60,
                    }
                end,
            }
            "#,
        );
        let (registry, loader) = loader_for(dir.path());
        loader.scan();

        let mut params = std::collections::HashMap::new();
        params.insert("name".to_owned(), "lua".to_owned());
        let mut headers = http::HeaderMap::new();
        headers.insert("x-tag", http::HeaderValue::from_static("v7"));
        let args = HookArgs::Request(crate::hooks::RequestArgs {
            path: None,
            params,
            headers,
            body: Bytes::from_static(b"payload"),
        });

        let executor = crate::hooks::executor::Executor::new(registry, false);
        let outcome = executor
            .call_sync("echo$", ALL_CATEGORIES, MatchMode::Inclusive, args)
            .await;
        let descriptor = outcome.unwrap().expect("descriptor");
        assert_eq!(descriptor.status, Some(200));
        assert_eq!(descriptor.entity_tag.as_deref(), Some("v7"));
        assert_eq!(descriptor.max_age, Some(60));
        match &descriptor.data {
            Payload::Bytes(b) => assert_eq!(&b[..], b"name=lua body=payload"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn maxage_false_disables_caching() {
        let dir = tempfile::tempdir().unwrap();
        write_module(
            dir.path(),
            "nocache.hook.lua",
            r#"
            return {
                ["hS_nc$"] = function(params, headers, body)
                    return { status = 200, data = "x", etag = "e", maxage = false }
                end,
            }
            "#,
        );
        let (registry, loader) = loader_for(dir.path());
        loader.scan();

        let executor = crate::hooks::executor::Executor::new(registry, false);
        let args = HookArgs::Request(crate::hooks::RequestArgs {
            path: None,
            params: Default::default(),
            headers: Default::default(),
            body: Bytes::new(),
        });
        let descriptor = executor
            .call_sync("nc$", ALL_CATEGORIES, MatchMode::Inclusive, args)
            .await
            .unwrap()
            .expect("descriptor");
        assert_eq!(descriptor.max_age, None);
        assert!(!descriptor.is_cacheable());
    }
}
