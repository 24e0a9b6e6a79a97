//! Chain invocation: CALL, CALL_SYNC, and DISPATCH drivers.
//!
//! One invocation walks the matching functions of a chain in priority
//! order, threading the running result through a per-invocation context.
//! SYNC functions replace the result with their return value, EVENT
//! functions leave it untouched, and ASYNC functions suspend the chain
//! until their continuation fires (exactly once; extra resumptions are
//! ignored).
//!
//! The terminal callback of a CALL-mode invocation always runs on a later
//! executor turn than the call site — the driver is a spawned task — which
//! keeps all-SYNC chains from growing the stack and normalizes completion
//! ordering.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::descriptor::ResponseDescriptor;

use super::registry::{HookChain, HookRegistry};
use super::{ExecPolicy, HookArgs, HookOutput, MatchMode};

/// Completion channel handed to an ASYNC hook. Resuming more than once is a
/// no-op; the chain observes only the first value.
#[derive(Clone)]
pub struct Continuation {
    tx: Arc<Mutex<Option<oneshot::Sender<HookOutput>>>>,
}

impl Continuation {
    /// Creates an armed continuation and the receiver the driver suspends
    /// on.
    pub fn armed() -> (Self, oneshot::Receiver<HookOutput>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A continuation that discards its value; used in DISPATCH mode where
    /// the chain never suspends.
    pub fn disarmed() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivers the hook's result. Returns false when the continuation has
    /// already fired (or was never armed).
    pub fn resume(&self, value: HookOutput) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// Once-only handle through which a manual-mode delegate returns the
/// response it produced.
#[derive(Clone)]
pub struct RespondHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<ResponseDescriptor>>>>,
}

impl RespondHandle {
    pub fn channel() -> (Self, oneshot::Receiver<ResponseDescriptor>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn send(&self, descriptor: ResponseDescriptor) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(descriptor).is_ok(),
            None => false,
        }
    }
}

/// Outcome delivered to a CALL-mode callback: the final chain result, or
/// the error of the hook that raised one (safe-hooks mode converts errors
/// before they get here).
pub type ChainOutcome = Result<HookOutput, anyhow::Error>;

/// Per-invocation record threading state between chain steps.
struct Context {
    last: HookOutput,
    next: usize,
}

enum InvokeMode {
    Call,
    CallSync,
    Dispatch,
}

/// Chain invocation front-end over a shared registry.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<HookRegistry>,
    safe_hooks: bool,
}

impl Executor {
    pub fn new(registry: Arc<HookRegistry>, safe_hooks: bool) -> Self {
        Self {
            registry,
            safe_hooks,
        }
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// True iff the chain exists and at least one function matches.
    pub fn check_target(&self, name: &str, requested: u32, mode: MatchMode) -> bool {
        self.registry.check_target(name, requested, mode)
    }

    /// CALL mode: runs the chain and delivers the final result to
    /// `callback` on a later executor turn, never synchronously.
    pub fn call(
        &self,
        name: &str,
        requested: u32,
        mode: MatchMode,
        args: HookArgs,
        callback: impl FnOnce(ChainOutcome) + Send + 'static,
    ) {
        let chain = self.registry.chain(name);
        let safe = self.safe_hooks;
        tokio::spawn(async move {
            let outcome = match chain {
                Some(chain) => run_chain(&chain, requested, mode, InvokeMode::Call, args, safe).await,
                None => Ok(None),
            };
            callback(outcome);
        });
    }

    /// CALL_SYNC mode: runs the chain inline, skipping ASYNC functions, and
    /// returns the final result directly.
    pub async fn call_sync(
        &self,
        name: &str,
        requested: u32,
        mode: MatchMode,
        args: HookArgs,
    ) -> ChainOutcome {
        match self.registry.chain(name) {
            Some(chain) => {
                run_chain(&chain, requested, mode, InvokeMode::CallSync, args, self.safe_hooks)
                    .await
            }
            None => Ok(None),
        }
    }

    /// DISPATCH mode: fire-and-forget. Result-producing hooks run but their
    /// results are discarded; ASYNC continuations are no-ops and the chain
    /// never suspends.
    pub fn dispatch(&self, name: &str, requested: u32, mode: MatchMode, args: HookArgs) {
        let Some(chain) = self.registry.chain(name) else {
            return;
        };
        let safe = self.safe_hooks;
        let name = name.to_owned();
        tokio::spawn(async move {
            if let Err(error) =
                run_chain(&chain, requested, mode, InvokeMode::Dispatch, args, safe).await
            {
                warn!(hook = %name, %error, "dispatched hook chain failed");
            }
        });
    }
}

async fn run_chain(
    chain: &HookChain,
    requested: u32,
    mode: MatchMode,
    invoke: InvokeMode,
    args: HookArgs,
    safe_hooks: bool,
) -> ChainOutcome {
    let mut ctx = Context {
        last: None,
        next: 0,
    };
    let functions = chain.functions();

    while ctx.next < functions.len() {
        let function = &functions[ctx.next];
        ctx.next += 1;
        if !super::mask_matches(function.mask, requested, mode) {
            continue;
        }

        match function.policy {
            ExecPolicy::Sync => {
                match guard((function.handler)(args.clone(), None).await, safe_hooks)? {
                    Guarded::Value(value) => {
                        if !matches!(invoke, InvokeMode::Dispatch) {
                            ctx.last = value;
                        }
                    }
                    Guarded::Fatal(descriptor) => return Ok(Some(descriptor)),
                }
            }
            ExecPolicy::Event => {
                match guard((function.handler)(args.clone(), None).await, safe_hooks)? {
                    Guarded::Value(_) => {}
                    Guarded::Fatal(descriptor) => return Ok(Some(descriptor)),
                }
            }
            ExecPolicy::Async => match invoke {
                InvokeMode::CallSync => continue,
                InvokeMode::Dispatch => {
                    let cont = Continuation::disarmed();
                    match guard(
                        (function.handler)(args.clone(), Some(cont)).await,
                        safe_hooks,
                    )? {
                        Guarded::Value(_) => {}
                        Guarded::Fatal(descriptor) => return Ok(Some(descriptor)),
                    }
                }
                InvokeMode::Call => {
                    let (cont, rx) = Continuation::armed();
                    match guard(
                        (function.handler)(args.clone(), Some(cont)).await,
                        safe_hooks,
                    )? {
                        Guarded::Value(_) => {}
                        Guarded::Fatal(descriptor) => return Ok(Some(descriptor)),
                    }
                    match rx.await {
                        Ok(value) => ctx.last = value,
                        Err(_) => {
                            // continuation dropped without resuming
                            let error = anyhow::anyhow!(
                                "async hook in {} dropped its continuation",
                                function.source
                            );
                            match guard(Err(error), safe_hooks)? {
                                Guarded::Value(_) => unreachable!(),
                                Guarded::Fatal(descriptor) => return Ok(Some(descriptor)),
                            }
                        }
                    }
                }
            },
        }
    }

    Ok(ctx.last)
}

enum Guarded {
    Value(HookOutput),
    Fatal(ResponseDescriptor),
}

/// Safe-hooks error guard: converts a raised error into a fatal descriptor
/// instead of propagating it to the dispatcher.
fn guard(result: anyhow::Result<HookOutput>, safe_hooks: bool) -> anyhow::Result<Guarded> {
    match result {
        Ok(value) => Ok(Guarded::Value(value)),
        Err(error) if safe_hooks => {
            warn!(%error, "hook raised an error; converted to fatal descriptor");
            Ok(Guarded::Fatal(ResponseDescriptor::fatal()))
        }
        Err(error) => Err(error),
    }
}
