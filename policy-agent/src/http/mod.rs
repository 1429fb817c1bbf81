mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Serves `/metrics` and `/readyz`. The agent reports ready while `ready`
/// holds `true`.
pub async fn serve_metrics(
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<()> {
    let state = Arc::new(metrics::State::new(ready));

    metrics::serve(addr, state, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
