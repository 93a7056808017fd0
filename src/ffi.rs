//! C-ABI binding surface (spec.md §6 / §12 of `SPEC_FULL.md`): a thin
//! opaque-handle façade for host languages that cannot call the native
//! API directly. Strings cross the boundary as `(*const c_char, usize)`
//! pairs rather than nul-terminated C strings, since trace/tag values are
//! not guaranteed to be nul-free.
//!
//! Every handle returned by a `_new`/`_create` function must be freed
//! exactly once with its matching `_free` function; using a handle after
//! freeing it is undefined behavior, same contract as any other opaque
//! C handle.

use crate::clock::SystemClock;
use crate::config::TracerConfigBuilder;
use crate::propagation::{Extractor, Injector};
use crate::span::{Span, SpanConfig};
use crate::tracer::Tracer;
use std::ffi::{c_char, CStr};
use std::os::raw::c_int;
use std::slice;
use std::sync::Arc;

unsafe fn str_from_raw(ptr: *const c_char, len: usize) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let bytes = slice::from_raw_parts(ptr as *const u8, len);
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Opaque builder handle. Create with [`dd_config_new`], configure with
/// `dd_config_set_*`, then consume exactly once with
/// [`dd_tracer_new`].
pub struct TracerConfigHandle(TracerConfigBuilder);

#[no_mangle]
pub extern "C" fn dd_config_new() -> *mut TracerConfigHandle {
    Box::into_raw(Box::new(TracerConfigHandle(TracerConfigBuilder::new())))
}

/// # Safety
/// `handle` must be a live pointer from [`dd_config_new`]; `service_ptr`
/// must point at `service_len` bytes of valid UTF-8.
#[no_mangle]
pub unsafe extern "C" fn dd_config_set_service(
    handle: *mut TracerConfigHandle,
    service_ptr: *const c_char,
    service_len: usize,
) -> c_int {
    let Some(handle) = handle.as_mut() else { return -1 };
    let Some(service) = str_from_raw(service_ptr, service_len) else { return -1 };
    let builder = std::mem::take(&mut handle.0);
    handle.0 = builder.with_service(service);
    0
}

/// # Safety
/// `handle` must be a live pointer from [`dd_config_new`].
#[no_mangle]
pub unsafe extern "C" fn dd_config_set_agent_url(
    handle: *mut TracerConfigHandle,
    url_ptr: *const c_char,
    url_len: usize,
) -> c_int {
    let Some(handle) = handle.as_mut() else { return -1 };
    let Some(url) = str_from_raw(url_ptr, url_len) else { return -1 };
    let builder = std::mem::take(&mut handle.0);
    handle.0 = builder.with_agent_url(url);
    0
}

/// # Safety
/// `handle` must be a live pointer from [`dd_config_new`]; it is freed by
/// this call regardless of success.
#[no_mangle]
pub unsafe extern "C" fn dd_config_free(handle: *mut TracerConfigHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Opaque tracer handle. Free exactly once with [`dd_tracer_free`].
pub struct TracerHandle(Arc<Tracer>);

/// # Safety
/// `config` must be a live pointer from [`dd_config_new`]; it is
/// consumed (freed) by this call. Requires the `reqwest-client` feature
/// for its default HTTP client.
#[cfg(feature = "reqwest-client")]
#[no_mangle]
pub unsafe extern "C" fn dd_tracer_new(config: *mut TracerConfigHandle) -> *mut TracerHandle {
    if config.is_null() {
        return std::ptr::null_mut();
    }
    let handle = Box::from_raw(config);
    let Ok(finalized) = handle.0.finalize() else {
        return std::ptr::null_mut();
    };
    let http = Arc::new(crate::transport::ReqwestClient::new());
    let tracer = Tracer::new(finalized, http, Arc::new(SystemClock));
    Box::into_raw(Box::new(TracerHandle(Arc::new(tracer))))
}

/// # Safety
/// `handle` must be a live pointer from [`dd_tracer_new`]; it is freed by
/// this call, which blocks for up to one second draining the collector.
#[no_mangle]
pub unsafe extern "C" fn dd_tracer_free(handle: *mut TracerHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Opaque span handle. Free exactly once with [`dd_span_free`].
pub struct SpanHandle(Span);

/// # Safety
/// `tracer` must be a live pointer from [`dd_tracer_new`]; `name_ptr`
/// must point at `name_len` bytes of valid UTF-8 or be null.
#[no_mangle]
pub unsafe extern "C" fn dd_tracer_create_span(
    tracer: *mut TracerHandle,
    name_ptr: *const c_char,
    name_len: usize,
) -> *mut SpanHandle {
    let Some(tracer) = tracer.as_ref() else { return std::ptr::null_mut() };
    let mut config = SpanConfig::default();
    config.name = str_from_raw(name_ptr, name_len);
    let span = tracer.0.create_span(config);
    Box::into_raw(Box::new(SpanHandle(span)))
}

/// # Safety
/// `span` must be a live pointer from [`dd_tracer_create_span`] or
/// [`dd_span_create_child`]; `key`/`value` must point at their declared
/// byte lengths of valid UTF-8.
#[no_mangle]
pub unsafe extern "C" fn dd_span_set_tag(
    span: *mut SpanHandle,
    key_ptr: *const c_char,
    key_len: usize,
    value_ptr: *const c_char,
    value_len: usize,
) -> c_int {
    let Some(span) = span.as_ref() else { return -1 };
    let (Some(key), Some(value)) = (str_from_raw(key_ptr, key_len), str_from_raw(value_ptr, value_len)) else {
        return -1;
    };
    span.0.set_tag(key, value);
    0
}

/// # Safety
/// `span` must be a live pointer from [`dd_tracer_create_span`].
#[no_mangle]
pub unsafe extern "C" fn dd_span_set_error(span: *mut SpanHandle, error: c_int) -> c_int {
    let Some(span) = span.as_ref() else { return -1 };
    span.0.set_error(error != 0);
    0
}

/// # Safety
/// `parent` must be a live pointer from [`dd_tracer_create_span`].
#[no_mangle]
pub unsafe extern "C" fn dd_span_create_child(
    parent: *mut SpanHandle,
    name_ptr: *const c_char,
    name_len: usize,
) -> *mut SpanHandle {
    let Some(parent) = parent.as_ref() else { return std::ptr::null_mut() };
    let mut config = SpanConfig::default();
    config.name = str_from_raw(name_ptr, name_len);
    let child = parent.0.create_child(config, &crate::span::SpanDefaults::default());
    Box::into_raw(Box::new(SpanHandle(child)))
}

/// # Safety
/// `span` must be a live pointer from [`dd_tracer_create_span`]; it is
/// freed by this call. `finish` is idempotent, but the handle itself may
/// only be freed once.
#[no_mangle]
pub unsafe extern "C" fn dd_span_finish(span: *mut SpanHandle) {
    if let Some(handle) = span.as_ref() {
        handle.0.finish();
    }
    if !span.is_null() {
        drop(Box::from_raw(span));
    }
}

/// A single `(key, value)` header pair used by [`dd_span_inject`]'s
/// callback, matching the `reader/writer callback` shape of spec.md §6.
#[repr(C)]
pub struct HeaderPair {
    pub key_ptr: *const c_char,
    pub key_len: usize,
    pub value_ptr: *const c_char,
    pub value_len: usize,
}

struct CallbackInjector {
    callback: extern "C" fn(*mut std::ffi::c_void, HeaderPair),
    user_data: *mut std::ffi::c_void,
    owned: Vec<(std::ffi::CString, std::ffi::CString)>,
}

impl Injector for CallbackInjector {
    fn set(&mut self, key: &str, value: String) {
        let key_c = std::ffi::CString::new(key).unwrap_or_default();
        let value_c = std::ffi::CString::new(value).unwrap_or_default();
        let pair = HeaderPair {
            key_ptr: key_c.as_ptr(),
            key_len: key.len(),
            value_ptr: value_c.as_ptr(),
            value_len: value_c.as_bytes().len(),
        };
        (self.callback)(self.user_data, pair);
        self.owned.push((key_c, value_c));
    }
}

/// # Safety
/// `tracer` and `span` must be live handles; `callback` is invoked
/// synchronously once per injected header, before this function returns.
#[no_mangle]
pub unsafe extern "C" fn dd_span_inject(
    tracer: *mut TracerHandle,
    span: *mut SpanHandle,
    callback: extern "C" fn(*mut std::ffi::c_void, HeaderPair),
    user_data: *mut std::ffi::c_void,
) -> c_int {
    let (Some(tracer), Some(span)) = (tracer.as_ref(), span.as_ref()) else {
        return -1;
    };
    let mut injector = CallbackInjector {
        callback,
        user_data,
        owned: Vec::new(),
    };
    tracer.0.inject_span(&span.0, &mut injector);
    0
}

struct CallbackExtractor<'a> {
    get: &'a dyn Fn(&str) -> Option<String>,
    last: std::cell::RefCell<Option<std::ffi::CString>>,
}

impl Extractor for CallbackExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let value = (self.get)(key)?;
        let c = std::ffi::CString::new(value).ok()?;
        let ptr = c.as_c_str().to_str().ok()?;
        *self.last.borrow_mut() = Some(c);
        // SAFETY: `self.last` keeps the `CString` alive for the borrow's
        // lifetime, which outlives this call per `CallbackExtractor`'s
        // single-threaded, single-call-at-a-time usage from `ffi`.
        let ptr: *const str = ptr;
        unsafe { Some(&*ptr) }
    }

    fn keys(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// # Safety
/// `tracer` must be a live handle; `get_header` must be safe to call with
/// an arbitrary nul-terminated ASCII header name and must return either
/// null or a valid nul-terminated UTF-8 string whose lifetime outlives
/// this call.
#[no_mangle]
pub unsafe extern "C" fn dd_tracer_extract_or_create_span(
    tracer: *mut TracerHandle,
    get_header: extern "C" fn(*mut std::ffi::c_void, *const c_char) -> *const c_char,
    user_data: *mut std::ffi::c_void,
) -> *mut SpanHandle {
    let Some(tracer) = tracer.as_ref() else { return std::ptr::null_mut() };

    let get = move |key: &str| -> Option<String> {
        let key_c = std::ffi::CString::new(key).ok()?;
        let raw = get_header(user_data, key_c.as_ptr());
        if raw.is_null() {
            return None;
        }
        Some(CStr::from_ptr(raw).to_string_lossy().into_owned())
    };
    let extractor = CallbackExtractor {
        get: &get,
        last: std::cell::RefCell::new(None),
    };

    let span = tracer.0.extract_or_create_span(&extractor, SpanConfig::default());
    Box::into_raw(Box::new(SpanHandle(span)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_lifecycle_does_not_crash() {
        unsafe {
            let config = dd_config_new();
            let service = b"svc";
            assert_eq!(
                dd_config_set_service(config, service.as_ptr() as *const c_char, service.len()),
                0
            );
            dd_config_free(config);
        }
    }
}
