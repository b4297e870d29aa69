//! C ABI for hosting a module from a C/C++ process.
//!
//! The host owns the broker connection and relays frames both ways: outbound
//! frames leave through the `on_write` callback registered at start, inbound
//! frames arrive through `modlink_on_read`. Every buffer is copied at the
//! boundary. Buffers this library hands out are freed only through
//! `modlink_buffer_free`/`modlink_string_free`; buffers the host hands in
//! through handler out-params must be malloc'd (they are freed here).

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::adapter::{Adapter, AdapterEvents, ConnectOptions, Transport};
use crate::error::{AdapterError, RequestError, StartError};
use crate::frame::{decode_frame, encode_frame, Frame, FrameDecodeError};
use crate::protocol::{NoticeEnvelope, RequestEnvelope, ResponseCode, ResponseEnvelope};
use crate::runtime::Module;
use crate::setting::{Handlers, NullStore, Setting};

/// Bumped on any change to the exported symbols or frame layout.
pub const MODLINK_ABI_VERSION: u32 = 1;

/// Host callback consuming one outbound frame. Bytes are valid only for the
/// duration of the call.
pub type OnWriteFn = extern "C" fn(data: *const u8, len: usize);

/// Host request handler. Returns a response wire code (200 = success). On
/// success fills out_buf/out_len with a malloc'd payload; on failure may fill
/// err_out with a malloc'd message. Both are freed by this library.
pub type OnRequestFn = extern "C" fn(
    route: *const c_char,
    payload: *const u8,
    payload_len: usize,
    out_buf: *mut *mut u8,
    out_len: *mut usize,
    err_out: *mut *mut c_char,
) -> u16;

/// Host notice handler. `retained` is nonzero for retained notices.
pub type OnNoticeFn =
    extern "C" fn(route: *const c_char, payload: *const u8, payload_len: usize, retained: c_int);

static PIPE: Mutex<Option<Arc<PipeShared>>> = Mutex::new(None);
static MODULE: Mutex<Option<Module>> = Mutex::new(None);

fn guard<T>(slot: &Mutex<Option<T>>) -> MutexGuard<'_, Option<T>> {
    match slot.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct PipeShared {
    on_write: OnWriteFn,
    events: Mutex<Option<AdapterEvents>>,
    pending: Mutex<HashMap<String, mpsc::Sender<ResponseEnvelope>>>,
    inbound: Mutex<Vec<u8>>,
    stopped: AtomicBool,
}

impl PipeShared {
    fn new(on_write: OnWriteFn) -> Self {
        Self {
            on_write,
            events: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn current_events(&self) -> Option<AdapterEvents> {
        self.events.lock().ok().and_then(|e| e.clone())
    }

    fn write_frame(&self, frame: &Frame) {
        match encode_frame(frame) {
            Ok(bytes) => (self.on_write)(bytes.as_ptr(), bytes.len()),
            Err(err) => warn!("plugin pipe: outbound frame dropped: {err}"),
        }
    }

    /// Append host bytes and dispatch every complete frame.
    fn feed(self: &Arc<Self>, bytes: &[u8]) {
        let frames = {
            let mut buf = match self.inbound.lock() {
                Ok(b) => b,
                Err(_) => return,
            };
            buf.extend_from_slice(bytes);
            let mut frames = Vec::new();
            loop {
                match decode_frame(&buf) {
                    Ok((frame, consumed)) => {
                        buf.drain(..consumed);
                        frames.push(frame);
                    }
                    Err(FrameDecodeError::NeedMore) => break,
                    Err(err) => {
                        warn!("plugin pipe: inbound stream corrupt, resetting: {err}");
                        buf.clear();
                        break;
                    }
                }
            }
            frames
        };
        for frame in frames {
            self.dispatch(frame);
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Response(resp) => {
                let sender = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut p| p.remove(&resp.id));
                if let Some(tx) = sender {
                    let _ = tx.send(resp);
                }
            }
            Frame::State(state) => {
                if let Some(events) = self.current_events() {
                    (events.on_status_changed)(state);
                }
            }
            Frame::Request(req) => {
                // Handlers may call back out through the pipe; keep the
                // reader path free.
                if let Some(events) = self.current_events() {
                    let pipe = Arc::clone(self);
                    thread::spawn(move || {
                        let resp = (events.on_request)(req);
                        pipe.write_frame(&Frame::Response(resp));
                    });
                }
            }
            Frame::Notice(notice) => {
                if let Some(events) = self.current_events() {
                    thread::spawn(move || (events.on_notice)(notice));
                }
            }
            Frame::RetainNotice(notice) => {
                if let Some(events) = self.current_events() {
                    thread::spawn(move || (events.on_retain_notice)(notice));
                }
            }
        }
    }

    fn shut(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

struct PipeTransport {
    shared: Arc<PipeShared>,
}

impl Transport for PipeTransport {
    fn connect(
        &self,
        opts: ConnectOptions,
        events: AdapterEvents,
    ) -> Result<Arc<dyn Adapter>, StartError> {
        if let Ok(mut slot) = self.shared.events.lock() {
            *slot = Some(events);
        }
        Ok(Arc::new(PipeAdapter {
            shared: Arc::clone(&self.shared),
            client_id: opts.client_id,
        }))
    }
}

struct PipeAdapter {
    shared: Arc<PipeShared>,
    client_id: String,
}

impl Adapter for PipeAdapter {
    fn request(
        &self,
        target: &str,
        route: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> ResponseEnvelope {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return ResponseEnvelope::orphan(ResponseCode::UnLinked, "pipe stopped");
        }
        let req = RequestEnvelope::new(&self.client_id, target, route, payload);
        let (tx, rx) = mpsc::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(req.id.clone(), tx);
        }
        self.shared.write_frame(&Frame::Request(req.clone()));
        match rx.recv_timeout(timeout) {
            Ok(resp) => resp,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&req.id);
                }
                ResponseEnvelope::orphan(ResponseCode::Timeout, "request timeout")
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                ResponseEnvelope::orphan(ResponseCode::UnLinked, "pipe stopped")
            }
        }
    }

    fn send_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(AdapterError("pipe stopped".to_string()));
        }
        let notice = NoticeEnvelope::new(&self.client_id, route, payload);
        self.shared.write_frame(&Frame::Notice(notice));
        Ok(())
    }

    fn send_retain_notice(&self, route: &str, payload: &[u8]) -> Result<(), AdapterError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(AdapterError("pipe stopped".to_string()));
        }
        let notice = NoticeEnvelope::new(&self.client_id, route, payload);
        self.shared.write_frame(&Frame::RetainNotice(notice));
        Ok(())
    }

    fn stop(&self) {
        self.shared.shut();
    }
}

/// ABI version of this library. Hosts check it before anything else.
#[no_mangle]
pub extern "C" fn modlink_abi_version() -> u32 {
    MODLINK_ABI_VERSION
}

/// Start the plugin module. config_json is a `Setting` as JSON (only `module`
/// is required). Blocks for the configured link wait. Returns 0 on success,
/// -1 on error (err_out filled; free with modlink_string_free).
#[no_mangle]
pub extern "C" fn modlink_start(
    config_json: *const c_char,
    on_write: Option<OnWriteFn>,
    on_request: Option<OnRequestFn>,
    on_notice: Option<OnNoticeFn>,
    err_out: *mut *mut c_char,
) -> c_int {
    let (Some(on_write), false) = (on_write, config_json.is_null()) else {
        set_err(err_out, "config_json and on_write are required");
        return -1;
    };
    let config = unsafe { CStr::from_ptr(config_json) };
    let setting: Setting = match serde_json::from_slice(config.to_bytes()) {
        Ok(s) => s,
        Err(err) => {
            set_err(err_out, &format!("bad config: {err}"));
            return -1;
        }
    };

    let pipe = Arc::new(PipeShared::new(on_write));
    {
        let mut slot = guard(&PIPE);
        if slot.is_some() {
            set_err(err_out, "module already started");
            return -1;
        }
        *slot = Some(Arc::clone(&pipe));
    }

    let transport = Arc::new(PipeTransport {
        shared: Arc::clone(&pipe),
    });
    let handlers = host_handlers(on_request, on_notice);
    match Module::start(setting, handlers, transport, Arc::new(NullStore)) {
        Ok(module) => {
            *guard(&MODULE) = Some(module);
            0
        }
        Err(err) => {
            *guard(&PIPE) = None;
            set_err(err_out, &err.to_string());
            -1
        }
    }
}

/// Push inbound bytes from the broker relay. May be called with partial
/// frames; complete frames are dispatched as they accumulate.
#[no_mangle]
pub extern "C" fn modlink_on_read(data: *const u8, len: usize) {
    if data.is_null() || len == 0 {
        return;
    }
    let pipe = guard(&PIPE).clone();
    let Some(pipe) = pipe else { return };
    let bytes = unsafe { slice::from_raw_parts(data, len) };
    pipe.feed(bytes);
}

/// Stop the module. Safe to call more than once.
#[no_mangle]
pub extern "C" fn modlink_stop() {
    let module = guard(&MODULE).take();
    let pipe = guard(&PIPE).take();
    if let Some(module) = module {
        module.stop();
    }
    if let Some(pipe) = pipe {
        pipe.shut();
    }
}

/// Send a request and wait for the reply. Returns the response wire code
/// (200 = success, out_buf/out_len filled; free with modlink_buffer_free).
/// On failure err_out is filled (free with modlink_string_free).
#[no_mangle]
pub extern "C" fn modlink_send_request(
    target: *const c_char,
    route: *const c_char,
    payload: *const u8,
    payload_len: usize,
    out_buf: *mut *mut u8,
    out_len: *mut usize,
    err_out: *mut *mut c_char,
) -> u16 {
    if target.is_null() || route.is_null() {
        set_err(err_out, "target and route are required");
        return ResponseCode::BadReq.wire_value();
    }
    let module = guard(&MODULE).clone();
    let Some(module) = module else {
        set_err(err_out, "module not started");
        return ResponseCode::UnLinked.wire_value();
    };
    let target = unsafe { CStr::from_ptr(target) }.to_string_lossy().into_owned();
    let route = unsafe { CStr::from_ptr(route) }.to_string_lossy().into_owned();
    let payload = copy_in(payload, payload_len);
    match module.send_request(&target, &route, &payload) {
        Ok(body) => {
            export_buffer(body, out_buf, out_len);
            ResponseCode::Success.wire_value()
        }
        Err(err) => {
            set_err(err_out, &err.message);
            err.code.wire_value()
        }
    }
}

/// Send a notice (`retained` nonzero retains it). Returns 0 on success.
#[no_mangle]
pub extern "C" fn modlink_send_notice(
    route: *const c_char,
    payload: *const u8,
    payload_len: usize,
    retained: c_int,
    err_out: *mut *mut c_char,
) -> c_int {
    if route.is_null() {
        set_err(err_out, "route is required");
        return -1;
    }
    let module = guard(&MODULE).clone();
    let Some(module) = module else {
        set_err(err_out, "module not started");
        return -1;
    };
    let route = unsafe { CStr::from_ptr(route) }.to_string_lossy().into_owned();
    let payload = copy_in(payload, payload_len);
    let sent = if retained != 0 {
        module.send_retain_notice(&route, &payload)
    } else {
        module.send_notice(&route, &payload)
    };
    match sent {
        Ok(()) => 0,
        Err(err) => {
            set_err(err_out, &err.message);
            -1
        }
    }
}

/// Free a buffer returned by this library. No-op on null.
#[no_mangle]
pub extern "C" fn modlink_buffer_free(buf: *mut u8, len: usize) {
    if buf.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(buf, len)) };
    alloc_count(-1);
}

/// Free an error string returned by this library. No-op on null.
#[no_mangle]
pub extern "C" fn modlink_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    let _ = unsafe { CString::from_raw(s) };
    alloc_count(-1);
}

fn copy_in(payload: *const u8, len: usize) -> Vec<u8> {
    if payload.is_null() || len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(payload, len) }.to_vec()
    }
}

fn export_buffer(data: Vec<u8>, out_buf: *mut *mut u8, out_len: *mut usize) {
    if out_buf.is_null() || out_len.is_null() {
        return;
    }
    if data.is_empty() {
        unsafe {
            *out_buf = ptr::null_mut();
            *out_len = 0;
        }
        return;
    }
    let boxed = data.into_boxed_slice();
    let len = boxed.len();
    unsafe {
        *out_len = len;
        *out_buf = Box::into_raw(boxed) as *mut u8;
    }
    alloc_count(1);
}

fn set_err(err_out: *mut *mut c_char, message: &str) {
    if err_out.is_null() {
        return;
    }
    let cleaned = message.replace('\0', " ");
    if let Ok(s) = CString::new(cleaned) {
        unsafe {
            *err_out = s.into_raw();
        }
        alloc_count(1);
    }
}

/// Copy then free a host-malloc'd string.
fn take_host_string(s: *mut c_char) -> Option<String> {
    if s.is_null() {
        return None;
    }
    let copied = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
    unsafe { libc::free(s as *mut c_void) };
    Some(copied)
}

fn host_handlers(on_request: Option<OnRequestFn>, on_notice: Option<OnNoticeFn>) -> Handlers {
    let mut handlers = Handlers::new();
    if let Some(f) = on_request {
        handlers = handlers.on_request(move |route, ctx| call_host_request(f, route, ctx.raw()));
    }
    if let Some(f) = on_notice {
        handlers = handlers
            .on_notice(move |route, ctx| call_host_notice(f, route, ctx.raw(), 0))
            .on_retain_notice(move |route, ctx| call_host_notice(f, route, ctx.raw(), 1));
    }
    handlers
}

fn call_host_request(
    f: OnRequestFn,
    route: &str,
    payload: &[u8],
) -> Result<Vec<u8>, RequestError> {
    let route_c =
        CString::new(route).map_err(|_| RequestError::bad_req("route contains NUL"))?;
    let mut out_buf: *mut u8 = ptr::null_mut();
    let mut out_len: usize = 0;
    let mut err: *mut c_char = ptr::null_mut();
    let code = f(
        route_c.as_ptr(),
        payload.as_ptr(),
        payload.len(),
        &mut out_buf,
        &mut out_len,
        &mut err,
    );
    let body = if out_buf.is_null() {
        Vec::new()
    } else {
        let copied = unsafe { slice::from_raw_parts(out_buf, out_len) }.to_vec();
        unsafe { libc::free(out_buf as *mut c_void) };
        copied
    };
    let message = take_host_string(err);
    match ResponseCode::from_wire(code) {
        Some(ResponseCode::Success) => Ok(body),
        Some(code) => Err(RequestError::new(
            code,
            message.unwrap_or_else(|| "request failed".to_string()),
        )),
        None => Err(RequestError::error(format!("unknown response code {code}"))),
    }
}

fn call_host_notice(f: OnNoticeFn, route: &str, payload: &[u8], retained: c_int) {
    let Ok(route_c) = CString::new(route) else {
        return;
    };
    f(route_c.as_ptr(), payload.as_ptr(), payload.len(), retained);
}

#[cfg(test)]
static OUTSTANDING: std::sync::atomic::AtomicIsize = std::sync::atomic::AtomicIsize::new(0);

#[cfg(test)]
fn alloc_count(delta: isize) {
    OUTSTANDING.fetch_add(delta, Ordering::SeqCst);
}

#[cfg(not(test))]
fn alloc_count(_delta: isize) {}
