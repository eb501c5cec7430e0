//! Process-wide and thread-local dispatch state.
//!
//! The resolved wide-precision mode and the extra-context tokens are folded
//! into every [call signature](crate::signature::CallSignature), so flipping
//! either scope partitions the dispatch cache instead of corrupting it.

use crate::config::GlobalConfig;
use crate::signature::OpaqueToken;
use std::cell::RefCell;

static GLOBAL_DISPATCH_STATE: spin::Mutex<Option<GlobalDispatchState>> = spin::Mutex::new(None);

thread_local! {
    static LOCAL_DISPATCH_STATE: RefCell<LocalDispatchState> =
        RefCell::new(LocalDispatchState::default());
}

/// Process-wide dispatch state, shared by every thread.
#[derive(Clone, Debug, Default)]
pub struct GlobalDispatchState {
    /// Wide-precision mode default.
    pub wide_precision: bool,
    /// Process-wide extra context merged into signatures.
    pub extra_context: Option<OpaqueToken>,
}

/// Thread-local overrides of the process-wide state.
#[derive(Clone, Debug, Default)]
pub struct LocalDispatchState {
    /// Wide-precision override; `None` defers to the global default.
    pub wide_precision: Option<bool>,
    /// Thread-local extra context merged into signatures.
    pub extra_context: Option<OpaqueToken>,
}

fn with_global<R>(f: impl FnOnce(&mut GlobalDispatchState) -> R) -> R {
    let mut state = GLOBAL_DISPATCH_STATE.lock();
    let state = state.get_or_insert_with(|| GlobalDispatchState {
        wide_precision: GlobalConfig::get().dispatch.wide_precision,
        extra_context: None,
    });
    f(state)
}

/// The wide-precision mode in effect on this thread.
pub fn resolved_wide_precision() -> bool {
    let local = LOCAL_DISPATCH_STATE.with(|local| local.borrow().wide_precision);
    local.unwrap_or_else(|| with_global(|global| global.wide_precision))
}

/// The process-wide extra context, if any.
pub fn global_extra_context() -> Option<OpaqueToken> {
    with_global(|global| global.extra_context.clone())
}

/// The thread-local extra context, if any.
pub fn local_extra_context() -> Option<OpaqueToken> {
    LOCAL_DISPATCH_STATE.with(|local| local.borrow().extra_context.clone())
}

/// Set the process-wide wide-precision default.
pub fn set_global_wide_precision(enabled: bool) {
    with_global(|global| global.wide_precision = enabled);
}

/// Set the process-wide extra context.
pub fn set_global_extra_context(context: Option<OpaqueToken>) {
    with_global(|global| global.extra_context = context);
}

/// Thread-local state override, restored when dropped.
pub struct LocalScope {
    previous: LocalDispatchState,
}

impl LocalScope {
    /// Replace this thread's dispatch state until the scope is dropped.
    pub fn enter(state: LocalDispatchState) -> Self {
        let previous = LOCAL_DISPATCH_STATE.with(|local| local.replace(state));
        Self { previous }
    }

    /// Override only the wide-precision mode on this thread.
    pub fn wide_precision(enabled: bool) -> Self {
        let state = LocalDispatchState {
            wide_precision: Some(enabled),
            ..LOCAL_DISPATCH_STATE.with(|local| local.borrow().clone())
        };
        Self::enter(state)
    }

    /// Override only the extra context on this thread.
    pub fn extra_context(context: OpaqueToken) -> Self {
        let state = LocalDispatchState {
            extra_context: Some(context),
            ..LOCAL_DISPATCH_STATE.with(|local| local.borrow().clone())
        };
        Self::enter(state)
    }
}

impl Drop for LocalScope {
    fn drop(&mut self) {
        LOCAL_DISPATCH_STATE.with(|local| {
            *local.borrow_mut() = core::mem::take(&mut self.previous);
        });
    }
}
