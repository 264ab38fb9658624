//! JNI exports for `com.bandbook.sync.RustBridge`.
//!
//! `init` returns an opaque handle owning a tokio runtime and one
//! [`ConnectionContext`]; every other call takes that handle. Long-running
//! work (connect, push, cancel) is spawned on the runtime and reports back
//! through the event queue drained by `pollEvent`.

use std::path::PathBuf;
use std::sync::Arc;

use jni::objects::{JByteArray, JClass, JObject, JString};
use jni::sys::{jboolean, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, error, info, warn, LevelFilter};
use tokio::runtime::Runtime;

use shared::LinkEvent;

use crate::config::SyncConfig;
use crate::context::ConnectionContext;
use crate::error::{CoreError, Result};
use crate::jni_transport::JniTransport;
use crate::logging;
use crate::transfer::Book;

/// What a handle points to
struct Bridge {
    runtime: Runtime,
    context: Arc<ConnectionContext<JniTransport>>,
}

fn create(env: &mut JNIEnv, link: &JObject, config_json: &JString) -> Result<Bridge> {
    let config = if config_json.is_null() {
        SyncConfig::default()
    } else {
        let json: String = env.get_string(config_json)?.into();
        SyncConfig::from_json(&json)?
    };
    logging::init(config.log_filter()?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("bandbook-core")
        .enable_time()
        .build()?;
    let transport = Arc::new(JniTransport::new(env, link)?);
    let context = Arc::new(ConnectionContext::new(transport, config));
    Ok(Bridge { runtime, context })
}

/// Borrow the bridge behind `handle`
///
/// # Safety
/// `handle` must be 0 or a value returned by `init` and not yet destroyed.
unsafe fn bridge<'a>(handle: jlong) -> Option<&'a Bridge> {
    let bridge = (handle as *const Bridge).as_ref();
    if bridge.is_none() {
        warn!("RustBridge called with a null handle");
    }
    bridge
}

fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// Create the native context
///
/// Called from Kotlin:
/// ```kotlin
/// external fun init(link: BandLink, configJson: String?): Long
/// ```
///
/// Returns: the handle, or 0 on error
#[no_mangle]
pub extern "system" fn Java_com_bandbook_sync_RustBridge_init(
    mut env: JNIEnv,
    _class: JClass,
    link: JObject,
    config_json: JString,
) -> jlong {
    match create(&mut env, &link, &config_json) {
        Ok(bridge) => {
            info!("BandBook core {} initialized", shared::VERSION);
            Box::into_raw(Box::new(bridge)) as jlong
        }
        Err(e) => {
            // Config errors can happen before the level is known
            logging::init(LevelFilter::Debug);
            error!("Failed to initialize: {}", e);
            0
        }
    }
}

/// Release the native context. The handle is invalid afterwards.
///
/// # Safety
/// `handle` must come from `init` and must not be used again.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_destroy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if handle == 0 {
        return;
    }
    let bridge = Box::from_raw(handle as *mut Bridge);
    let Bridge { runtime, context } = *bridge;
    runtime.block_on(context.disconnect());
    runtime.shutdown_background();
    info!("BandBook core destroyed");
}

/// Start connecting to the band; the outcome arrives as events
///
/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_connect(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    let Some(bridge) = bridge(handle) else {
        return;
    };
    let context = bridge.context.clone();
    bridge.runtime.spawn(async move {
        if let Err(e) = context.connect().await {
            warn!("Connect failed: {}", e);
        }
    });
}

/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_disconnect(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    let Some(bridge) = bridge(handle) else {
        return;
    };
    let context = bridge.context.clone();
    bridge.runtime.spawn(async move { context.disconnect().await });
}

/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_isConnected(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    bridge(handle).map_or(JNI_FALSE, |b| to_jboolean(b.context.is_connected()))
}

/// Push a book to the band
///
/// Called from Kotlin:
/// ```kotlin
/// external fun pushBook(handle: Long, name: String, path: String, size: Long): Boolean
/// ```
///
/// Returns: false if a transfer is already running or the arguments are bad
///
/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_pushBook(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    name: JString,
    path: JString,
    size: jlong,
) -> jboolean {
    let Some(bridge) = bridge(handle) else {
        return JNI_FALSE;
    };
    if bridge.context.is_busy() {
        warn!("pushBook called while a transfer is running");
        return JNI_FALSE;
    }

    let book = match read_book(&mut env, &name, &path, size) {
        Ok(book) => book,
        Err(e) => {
            error!("Bad pushBook arguments: {}", e);
            return JNI_FALSE;
        }
    };

    let context = bridge.context.clone();
    bridge.runtime.spawn(async move {
        match context.push_book(book).await {
            Ok(outcome) => debug!("Push finished: {:?}", outcome),
            Err(e) => debug!("Push failed: {}", e),
        }
    });
    JNI_TRUE
}

fn read_book(env: &mut JNIEnv, name: &JString, path: &JString, size: jlong) -> Result<Book> {
    let name: String = env.get_string(name)?.into();
    let path: String = env.get_string(path)?.into();
    let size = u64::try_from(size).map_err(|_| CoreError::Protocol(format!("negative size {}", size)))?;
    Ok(Book {
        name,
        path: PathBuf::from(path),
        size,
    })
}

/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_cancel(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    let Some(bridge) = bridge(handle) else {
        return;
    };
    let context = bridge.context.clone();
    bridge.runtime.spawn(async move {
        context.cancel().await;
    });
}

/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_isBusy(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    bridge(handle).map_or(JNI_FALSE, |b| to_jboolean(b.context.is_busy()))
}

/// Inbound frame from the band, forwarded by the Kotlin link listener
///
/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_onMessage(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
    frame: JByteArray,
) {
    let Some(bridge) = bridge(handle) else {
        return;
    };
    match env.convert_byte_array(&frame) {
        Ok(bytes) => {
            debug!("Inbound frame: {} bytes", bytes.len());
            bridge.context.transport().deliver(LinkEvent::Message(bytes));
        }
        Err(e) => error!("Failed to copy inbound frame: {}", e),
    }
}

/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_onLinkLost(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    if let Some(bridge) = bridge(handle) {
        bridge.context.transport().deliver(LinkEvent::Lost);
    }
}

/// Next queued event as JSON
///
/// Called from Kotlin:
/// ```kotlin
/// external fun pollEvent(handle: Long): String?
/// ```
///
/// Returns: `{"event":"progress","fraction":0.5,...}` or null when the queue is empty
///
/// # Safety
/// `handle` must come from `init`.
#[no_mangle]
pub unsafe extern "system" fn Java_com_bandbook_sync_RustBridge_pollEvent(
    env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jstring {
    let Some(event) = bridge(handle).and_then(|b| b.context.poll_event()) else {
        return std::ptr::null_mut();
    };
    let json = match serde_json::to_string(&event) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return std::ptr::null_mut();
        }
    };
    match env.new_string(&json) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create event string: {}", e);
            std::ptr::null_mut()
        }
    }
}
