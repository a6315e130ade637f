//! Agent dispatcher: tunnel frames in, origin requests out

use std::sync::Arc;

use tracing::{debug, warn};

use passage_control::{Channel, ChannelHandle, IncomingRequest};
use passage_proto::{Flavor, TunnelEvent, WireFamily};

use crate::config::AgentConfig;
use crate::origin_http2::H2Origin;
use crate::{origin_http1, origin_http2, AgentError};

/// Serve tunneled requests until the channel closes.
pub async fn serve(channel: Channel, origin: Arc<H2Origin>, config: AgentConfig) {
    let handle = channel.handle;
    let mut incoming = channel.incoming;

    while let Some(request) = incoming.recv().await {
        let handle = handle.clone();
        let origin = origin.clone();
        let config = config.clone();
        tokio::spawn(async move {
            handle_request(handle, origin, config, request).await;
        });
    }
    debug!("Request stream ended, dispatcher exiting");
}

async fn handle_request(
    handle: ChannelHandle,
    origin: Arc<H2Origin>,
    config: AgentConfig,
    request: IncomingRequest,
) {
    let id = request.id;
    let flavor = request.descriptor.flavor;
    let family = WireFamily::from(flavor);
    debug!(%id, method = %request.descriptor.method, path = %request.descriptor.path, ?flavor, "Tunneled request");

    let result = match flavor {
        Flavor::Http1 => origin_http1::forward(&handle, &config, request).await,
        Flavor::Http2 => origin_http2::forward(&handle, &origin, request).await,
    };

    if let Err(err) = result {
        warn!(%id, %err, "Forward failed");
        let _ = handle
            .send(
                TunnelEvent::ResponseError {
                    id,
                    message: err.wire_message(),
                },
                family,
            )
            .await;
    }
    handle.release(&id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_unavailable_wire_message() {
        // The edge matches on this text to produce its 502.
        assert_eq!(
            AgentError::OriginUnavailable.wire_message(),
            "Local client not connected"
        );
    }
}
