pub mod handler;
pub mod nic;
pub mod ovs;
pub mod request;

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::routing::post;
use kube::Client;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DaemonArgs;
use crate::util::NETWORK_TYPE_VLAN;
use crate::{Error, Result};

/// Node-local CNI server: the shim posts add/del over the Unix socket, the
/// handlers bind pods to OVS and keep the IP objects in step.
pub async fn start(args: DaemonArgs, cancel: CancellationToken) -> Result<()> {
    let client = Client::try_default().await?;

    if args.network_type == NETWORK_TYPE_VLAN && !args.provider_nic.is_empty() {
        info!("configuring provider bridge for {}", args.provider_nic);
        ovs::ensure_provider_bridge(&args.provider_nic).await?;
    }

    let listener = bind_cni_socket(&args.socket_path)?;
    info!("cni server listening on {}", args.socket_path.display());

    let state = Arc::new(handler::CniHandler::new(client, args));
    let app = Router::new()
        .route("/add", post(handler::handle_add))
        .route("/del", post(handler::handle_del))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

/// A restarted daemon finds the socket inode of its previous life still on
/// disk, and bind() refuses to reuse it; clear it out first.
fn bind_cni_socket(path: &Path) -> Result<UnixListener> {
    match path.parent() {
        Some(dir) => fs::create_dir_all(dir)?,
        None => {
            return Err(Error::Validation(format!(
                "socket path {} has no parent directory",
                path.display()
            )));
        }
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await
}
