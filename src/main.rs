use squidrelay::cache::ObjectCache;
use squidrelay::error::ProxyError;
use squidrelay::pipeline::{forward_client_request, forward_server_response, parse_request, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// One worker per accepted connection: parse, (maybe) fetch from cache,
/// (maybe) forward to the origin, write the response, close.
async fn handle_connection(mut client: TcpStream, cache: ObjectCache) {
    let request = match parse_request(&mut client).await {
        Ok(request) => request,
        Err(ProxyError::ClientProtocol { status, reason }) => {
            debug!(status, reason, "client protocol error, error page already sent");
            return;
        }
        Err(e) => {
            debug!(error = %e, "failed to read client request");
            return;
        }
    };

    if let Some(cached) = cache.fetch(&request.request_line, &request.headers).await {
        info!(host = %request.hostname, path = %request.path, "cache hit");
        let response = Response {
            status_line: cached.status_line,
            headers: cached.headers,
            body: cached.body,
            body_len: cached.body_len,
        };
        if let Err(e) = forward_server_response(&mut client, &response).await {
            debug!(error = %e, "failed to write cached response to client");
        }
        return;
    }

    debug!(host = %request.hostname, path = %request.path, "cache miss");
    let response = match forward_client_request(&request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, host = %request.hostname, "upstream fetch failed");
            return;
        }
    };

    if let Err(e) = forward_server_response(&mut client, &response).await {
        debug!(error = %e, "failed to write response to client");
        return;
    }

    cache
        .insert(
            &request.request_line,
            &request.headers,
            response.status_line,
            response.headers,
            response.body,
            response.body_len,
        )
        .await;
}

fn parse_port(args: &[String]) -> u16 {
    let Some(port_arg) = args.get(1) else {
        eprintln!("usage: {} <port>", args.first().map(String::as_str).unwrap_or("proxy"));
        std::process::exit(1);
    };
    match port_arg.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("usage: {} <port>", args.first().map(String::as_str).unwrap_or("proxy"));
            std::process::exit(1);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("squidrelay=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = parse_port(&args);

    let cache = ObjectCache::new();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let active_connections = Arc::new(AtomicUsize::new(0));

    info!(port, "forward proxy listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((client, addr)) => {
                        debug!(%addr, "accepted connection");
                        let cache = cache.clone();
                        let active_connections = active_connections.clone();
                        active_connections.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            handle_connection(client, cache).await;
                            active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }

    info!(
        active = active_connections.load(Ordering::Relaxed),
        "waiting for in-flight connections to close"
    );
    while active_connections.load(Ordering::Relaxed) > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    info!("all connections closed, shutting down");

    Ok(())
}
