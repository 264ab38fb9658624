//! [`Transport`] backed by the Kotlin `BandLink` object.
//!
//! The vendor SDK calls are blocking on the Kotlin side, so every call runs on
//! a blocking thread attached to the JVM. Inbound frames come back through
//! `RustBridge.onMessage` / `RustBridge.onLinkLost` and are handed to
//! [`JniTransport::deliver`].
//!
//! Kotlin side:
//! ```kotlin
//! interface BandLink {
//!     fun connect(): String?          // band node id, null if none
//!     fun auth(): Boolean
//!     fun isRemoteAppInstalled(): Boolean
//!     fun openRemoteApp(): Boolean
//!     fun registerListener()
//!     fun removeListener()
//!     fun send(frame: ByteArray): Boolean
//!     fun teardown()
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jni::objects::{GlobalRef, JObject, JString, JValue};
use jni::{JNIEnv, JavaVM};
use log::{debug, warn};

use shared::{DeviceId, LinkEvent, LinkSink, Transport, TransportError, TransportResult};

use crate::error::Result;

/// Link to the band through the app's Kotlin `BandLink` object
pub struct JniTransport {
    vm: Arc<JavaVM>,
    link: Arc<GlobalRef>,
    sink: Mutex<Option<LinkSink>>,
}

impl JniTransport {
    /// Pin `link` as a global ref so it outlives the JNI call
    pub fn new(env: &mut JNIEnv, link: &JObject) -> Result<Self> {
        let vm = env.get_java_vm()?;
        let link = env.new_global_ref(link)?;
        Ok(Self {
            vm: Arc::new(vm),
            link: Arc::new(link),
            sink: Mutex::new(None),
        })
    }

    /// Hand a link event to the registered listener
    pub fn deliver(&self, event: LinkEvent) {
        match self.lock_sink().as_ref() {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!("Listener gone, link event dropped");
                }
            }
            None => debug!("No listener registered, link event dropped"),
        }
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<LinkSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the link object on a blocking thread
    async fn call<R, F>(&self, method: &'static str, f: F) -> TransportResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<R> + Send + 'static,
    {
        let vm = self.vm.clone();
        let link = self.link.clone();
        let handle = tokio::task::spawn_blocking(move || call_now(&vm, &link, method, f));
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Other(format!("{}: {}", method, e))),
        }
    }

    async fn call_bool(&self, method: &'static str) -> TransportResult<bool> {
        self.call(method, move |env, link| env.call_method(link, method, "()Z", &[])?.z())
            .await
    }
}

fn call_now<R>(
    vm: &JavaVM,
    link: &GlobalRef,
    method: &'static str,
    f: impl FnOnce(&mut JNIEnv, &JObject) -> jni::errors::Result<R>,
) -> TransportResult<R> {
    let mut env = vm
        .attach_current_thread()
        .map_err(|e| TransportError::Other(format!("attach failed: {}", e)))?;
    let result = f(&mut *env, link.as_obj());
    // A thrown Kotlin exception must not stay pending on this thread
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
    }
    result.map_err(|e| {
        warn!("BandLink.{} failed: {}", method, e);
        TransportError::Other(format!("{}: {}", method, e))
    })
}

impl Transport for JniTransport {
    async fn connect(&self) -> TransportResult<DeviceId> {
        let node = self
            .call("connect", |env, link| {
                let node = env
                    .call_method(link, "connect", "()Ljava/lang/String;", &[])?
                    .l()?;
                if node.is_null() {
                    return Ok(None);
                }
                let node: String = env.get_string(&JString::from(node))?.into();
                Ok(Some(node))
            })
            .await?;
        node.map(DeviceId).ok_or(TransportError::NoDevice)
    }

    async fn auth(&self) -> TransportResult<()> {
        if self.call_bool("auth").await? {
            Ok(())
        } else {
            Err(TransportError::AuthFailed("permission refused".into()))
        }
    }

    async fn query_remote_app_installed(&self) -> TransportResult<bool> {
        self.call_bool("isRemoteAppInstalled").await
    }

    async fn open_remote_app(&self) -> TransportResult<()> {
        if self.call_bool("openRemoteApp").await? {
            Ok(())
        } else {
            Err(TransportError::LaunchFailed("band app did not start".into()))
        }
    }

    fn register_listener(&self, sink: LinkSink) -> TransportResult<()> {
        *self.lock_sink() = Some(sink);
        call_now(&self.vm, &self.link, "registerListener", |env, link| {
            env.call_method(link, "registerListener", "()V", &[])?.v()
        })
    }

    fn remove_listener(&self) {
        self.lock_sink().take();
        let removed = call_now(&self.vm, &self.link, "removeListener", |env, link| {
            env.call_method(link, "removeListener", "()V", &[])?.v()
        });
        if let Err(e) = removed {
            debug!("Listener removal failed: {}", e);
        }
    }

    async fn send(&self, frame: &[u8]) -> TransportResult<()> {
        let frame = frame.to_vec();
        let len = frame.len();
        let accepted = self
            .call("send", move |env, link| {
                let array = env.byte_array_from_slice(&frame)?;
                env.call_method(link, "send", "([B)Z", &[JValue::Object(&array)])?
                    .z()
            })
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(TransportError::SendFailed(format!("link refused {} byte frame", len)))
        }
    }

    async fn teardown(&self) {
        let result = self
            .call("teardown", |env, link| {
                env.call_method(link, "teardown", "()V", &[])?.v()
            })
            .await;
        if let Err(e) = result {
            warn!("Link teardown failed: {}", e);
        }
    }
}
