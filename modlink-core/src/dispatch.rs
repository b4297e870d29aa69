//! Inbound dispatch: system routes, user handler invocation, panic containment.
//!
//! Every inbound request produces exactly one response envelope. A panicking
//! handler is contained to its request: the caller gets an `Error` response
//! and the runtime keeps serving.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::context::{json_payload, Context};
use crate::error::RequestError;
use crate::protocol::{
    routes, NoticeEnvelope, RequestEnvelope, ResponseCode, ResponseEnvelope, FRAMEWORK_VERSION,
};
use crate::setting::{Handlers, Setting};

pub struct Dispatcher {
    module: String,
    version: String,
    handlers: Handlers,
    /// Present in sync mode: serializes request dispatch into arrival order.
    sync_gate: Option<Mutex<()>>,
    /// Invoked when the reserved `Exit` route fires, after the reply is built.
    on_exit: Arc<dyn Fn() + Send + Sync>,
}

impl Dispatcher {
    pub fn new(setting: &Setting, handlers: Handlers, on_exit: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            module: setting.module.clone(),
            version: setting.version.clone(),
            handlers,
            sync_gate: setting.sync_dispatch.then(|| Mutex::new(())),
            on_exit,
        }
    }

    /// Version strings reported on the reserved `Version` route.
    pub fn versions(&self) -> Vec<String> {
        vec![
            format!("{} {}", self.module, self.version),
            format!("modlink {FRAMEWORK_VERSION}"),
        ]
    }

    pub fn dispatch_request(&self, req: &RequestEnvelope) -> ResponseEnvelope {
        let _gate = match &self.sync_gate {
            Some(gate) => gate.lock().ok(),
            None => None,
        };

        // System routes are handled before any user code and never delegated.
        match req.route.as_str() {
            routes::EXIT => {
                (self.on_exit)();
                return ResponseEnvelope::success(req, Vec::new());
            }
            routes::VERSION => {
                return ResponseEnvelope::success(req, json_payload(&self.versions()));
            }
            _ => {}
        }

        let handler = match &self.handlers.on_request {
            Some(h) => Arc::clone(h),
            None => {
                let err = RequestError::route_not_find();
                return ResponseEnvelope::failure(req, err.code, &err.message);
            }
        };

        let ctx = match Context::from_payload(&req.payload) {
            Ok(ctx) => ctx,
            Err(err) => return ResponseEnvelope::failure(req, err.code, &err.message),
        };

        let route = req.route.clone();
        match catch_unwind(AssertUnwindSafe(|| handler(&route, &ctx))) {
            Ok(Ok(payload)) => ResponseEnvelope::success(req, payload),
            Ok(Err(err)) => ResponseEnvelope::failure(req, err.code, &err.message),
            Err(panic) => {
                let message = panic_message(&panic);
                error!(
                    "[{}] handler panicked on route {}: {message} (payload {} bytes)",
                    self.module,
                    req.route,
                    req.payload.len()
                );
                ResponseEnvelope::failure(req, ResponseCode::Error, &message)
            }
        }
    }

    pub fn dispatch_notice(&self, notice: &NoticeEnvelope, retained: bool) {
        let handler = if retained {
            &self.handlers.on_retain_notice
        } else {
            &self.handlers.on_notice
        };
        let handler = match handler {
            Some(h) => Arc::clone(h),
            None => return,
        };
        let ctx = match Context::from_payload(&notice.payload) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(
                    "[{}] dropped notice on route {}: {}",
                    self.module, notice.route, err
                );
                return;
            }
        };
        let route = notice.route.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&route, &ctx))) {
            error!(
                "[{}] notice handler panicked on route {}: {}",
                self.module,
                notice.route,
                panic_message(&panic)
            );
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
