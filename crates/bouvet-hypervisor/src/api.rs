//! Control channel to the Firecracker API socket.
//!
//! Firecracker exposes a small REST API over a Unix domain socket. The
//! [`ControlApi`] trait covers the calls this driver makes; [`ControlChannel`]
//! implements it with hyper + hyperlocal. No call is retried here: a failed
//! request surfaces as-is and the caller decides what to do about it.

use crate::error::{HypervisorError, Result};
use crate::models::{
    BootSource, Drive, InstanceActionInfo, InstanceInfo, MachineConfiguration, NetworkInterface,
    PartialDrive, Vsock,
};
use async_trait::async_trait;
use hyper::client::Client;
use hyper::{Body, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Operations of the Firecracker control API used by the driver.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /`
    async fn describe_instance(&self) -> Result<InstanceInfo>;

    /// `PUT /machine-config`
    async fn put_machine_config(&self, config: &MachineConfiguration) -> Result<()>;

    /// `PUT /boot-source`
    async fn put_boot_source(&self, source: &BootSource) -> Result<()>;

    /// `PUT /drives/{id}`. Declares a new drive; only valid before boot.
    async fn put_drive(&self, drive: &Drive) -> Result<()>;

    /// `PATCH /drives/{id}`. Swaps the backing path of a declared drive.
    async fn patch_drive(&self, drive: &PartialDrive) -> Result<()>;

    /// `PUT /network-interfaces/{id}`
    async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()>;

    /// `PUT /vsock`
    async fn put_vsock(&self, vsock: &Vsock) -> Result<()>;

    /// `PUT /actions`
    async fn create_action(&self, action: &InstanceActionInfo) -> Result<()>;
}

/// Builds control channels bound to an API socket.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, socket_path: &Path) -> Arc<dyn ControlApi>;
}

/// Connector producing [`ControlChannel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketConnector;

impl ApiConnector for SocketConnector {
    fn connect(&self, socket_path: &Path) -> Arc<dyn ControlApi> {
        Arc::new(ControlChannel::new(socket_path))
    }
}

/// HTTP client talking to one Firecracker API socket.
///
/// The underlying hyper client keeps the connection alive between calls, so
/// every request made through one channel reuses the same socket connection.
pub struct ControlChannel {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl ControlChannel {
    /// Create a channel for the API socket at `socket_path`.
    ///
    /// Nothing is dialed until the first request.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    /// Path of the API socket this channel talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        self.send(Method::PUT, path, Some(serde_json::to_string(body)?))
            .await
            .map(|_| ())
    }

    async fn patch<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        self.send(Method::PATCH, path, Some(serde_json::to_string(body)?))
            .await
            .map(|_| ())
    }

    async fn send(&self, method: Method, path: &str, body: Option<String>) -> Result<Vec<u8>> {
        let request_name = format!("{method} {path}");
        tracing::trace!(
            request = %request_name,
            socket = %self.socket_path.display(),
            body = body.as_deref().unwrap_or(""),
            "Sending API request"
        );

        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let request = builder
            .header("Accept", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|e| HypervisorError::Transport(format!("failed to build {request_name}: {e}")))?;

        let response = self.client.request(request).await.map_err(|e| {
            HypervisorError::Transport(format!("{request_name} request failed: {e}"))
        })?;

        let status = response.status();
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| {
                HypervisorError::Transport(format!("failed to read {request_name} response: {e}"))
            })?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            tracing::debug!(request = %request_name, status = %status, body = %body, "API request rejected");
            return Err(HypervisorError::Api {
                request: request_name,
                status: status.as_u16(),
                body,
            });
        }

        Ok(body_bytes.to_vec())
    }
}

#[async_trait]
impl ControlApi for ControlChannel {
    async fn describe_instance(&self) -> Result<InstanceInfo> {
        let body = self.send(Method::GET, "/", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn put_machine_config(&self, config: &MachineConfiguration) -> Result<()> {
        self.put("/machine-config", config).await
    }

    async fn put_boot_source(&self, source: &BootSource) -> Result<()> {
        self.put("/boot-source", source).await
    }

    async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    async fn patch_drive(&self, drive: &PartialDrive) -> Result<()> {
        self.patch(&format!("/drives/{}", drive.drive_id), drive)
            .await
    }

    async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    async fn put_vsock(&self, vsock: &Vsock) -> Result<()> {
        self.put("/vsock", vsock).await
    }

    async fn create_action(&self, action: &InstanceActionInfo) -> Result<()> {
        self.put("/actions", action).await
    }
}
