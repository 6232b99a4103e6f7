//! HTTP server for the Prometheus metrics endpoint.

use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info, warn};
use prometheus::{Encoder, TextEncoder};
use std::io::Write;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::MetricsContext;

async fn handle_metrics_request(ctx: &MetricsContext, mut stream: TcpStream) {
    let mut headers = [0u8; 1024];
    let n = match stream.read(&mut headers).await {
        Ok(n) => n,
        Err(e) => {
            warn!("failed to read metrics request: {e}");
            return;
        }
    };
    let headers_str = String::from_utf8_lossy(&headers[..n]);
    let accepts_gzip =
        headers_str.contains("Accept-Encoding") && headers_str.to_lowercase().contains("gzip");

    ctx.update_metrics();

    let encoder = TextEncoder::new();
    let families = ctx.registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("failed to encode metrics: {e}");
        return;
    }

    let (body, content_encoding) = if accepts_gzip {
        let mut compressed = Vec::new();
        {
            let mut gz = GzEncoder::new(&mut compressed, Compression::default());
            if gz.write_all(&buffer).and_then(|_| gz.finish().map(|_| ())).is_err() {
                warn!("failed to gzip metrics payload");
                return;
            }
        }
        (compressed, "Content-Encoding: gzip\r\n")
    } else {
        (buffer, "")
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        encoder.format_type(),
        content_encoding,
        body.len()
    );

    if let Err(e) = stream.write_all(header.as_bytes()).await {
        warn!("failed to write metrics response: {e}");
        return;
    }
    if let Err(e) = stream.write_all(&body).await {
        warn!("failed to write metrics body: {e}");
    }
    let _ = stream.shutdown().await;
}

/// Serves `/metrics` until the shutdown flag flips.
pub async fn start_metrics_server(
    ctx: Arc<MetricsContext>,
    addr: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("metrics exporter cannot bind {addr}: {e}");
            return;
        }
    };
    info!("Metrics exporter listening on http://{addr}/metrics");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => handle_metrics_request(&ctx, stream).await,
                    Err(e) => warn!("metrics accept error: {e}"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
