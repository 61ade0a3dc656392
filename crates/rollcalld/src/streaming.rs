//! Bridges a blocking [`RecognitionStream`] onto an HTTP response body.
//!
//! Each consumer gets its own OS thread that owns the camera, the models and a
//! database connection. Parts travel through a bounded channel; when the
//! client goes away the next send fails and the thread winds down.

use crate::store::SqliteStore;
use actix_web::web::Bytes;
use futures::Stream;
use rollcall_core::attendance::SessionId;
use rollcall_core::{Config, RecognitionStream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Parts buffered ahead of the client.
const CHANNEL_CAPACITY: usize = 2;

/// Start a stream thread and return its parts as a response body.
pub fn spawn(
    config: Arc<Config>,
    session: SessionId,
    debug: bool,
) -> std::io::Result<impl Stream<Item = Result<Bytes, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let stream_id = Uuid::new_v4();
    let span = tracing::info_span!("stream", id = %stream_id, session);

    std::thread::Builder::new()
        .name(format!("stream-{session}"))
        .spawn(move || {
            let _guard = span.enter();
            let store = match SqliteStore::open(&config.paths.database) {
                Ok(store) => store,
                Err(e) => {
                    tracing::error!(error = %e, "stream could not open the database");
                    return;
                }
            };

            let mut parts = 0u64;
            for part in RecognitionStream::from_config(&config, session, debug, store) {
                if tx.blocking_send(Bytes::from(part)).is_err() {
                    break;
                }
                parts += 1;
            }
            tracing::info!(parts, "stream consumer disconnected");
        })?;

    Ok(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|part| (Ok(part), rx))
    }))
}
