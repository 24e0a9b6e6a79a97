//! Listener manager and connection loops.
//!
//! Binds every `(addr, port)` pair as plaintext HTTP/1.1 and, when the TLS
//! material loads, every `(addr, secure_port)` pair as HTTPS. Each
//! connection runs in its own tokio task; requests dispatch through
//! [`crate::dispatch::handle`]. Incomplete TLS material skips the HTTPS
//! endpoints with a diagnostic and the plaintext endpoints still start.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::dispatch::{self, ConnectionKill, Server};
use crate::server_tls;
use crate::types::BoxError;

/// Binds all configured endpoints and serves until every accept loop ends.
pub async fn serve(server: Arc<Server>) -> Result<(), BoxError> {
    let config = server.config();

    let acceptor = match &config.secure {
        Some(material) => match server_tls::build_acceptor(material) {
            Ok(acceptor) => {
                server.set_tls_active(true);
                Some(acceptor)
            }
            Err(error) => {
                warn!(%error, "TLS material incomplete; HTTPS endpoints disabled");
                None
            }
        },
        None => None,
    };

    let mut endpoints = Vec::new();
    for addr in &config.addrs {
        for port in &config.ports {
            endpoints.push((SocketAddr::new(*addr, *port), None));
        }
        if let Some(acceptor) = &acceptor {
            for port in &config.secure_ports {
                endpoints.push((SocketAddr::new(*addr, *port), Some(acceptor.clone())));
            }
        }
    }

    let mut loops = Vec::new();
    for (addr, acceptor) in endpoints {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(%addr, error = %e, "unable to bind listener");
            Box::new(e) as BoxError
        })?;
        let secure = acceptor.is_some();
        info!(%addr, secure, "listening");
        loops.push(tokio::spawn(accept_loop(
            listener,
            server.clone(),
            acceptor,
        )));
    }

    for task in loops {
        let _ = task.await;
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, server: Arc<Server>, acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let server = server.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => serve_connection(TokioIo::new(tls), server, peer, true).await,
                    Err(error) => debug!(%peer, %error, "TLS handshake failed"),
                },
                None => serve_connection(TokioIo::new(stream), server, peer, false).await,
            }
        });
    }
}

async fn serve_connection<I>(io: I, server: Arc<Server>, peer: SocketAddr, secure: bool)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
{
    let kill = Arc::new(tokio::sync::Notify::new());
    let svc_kill = kill.clone();
    let svc = service_fn(move |mut req: Request<_>| {
        let server = server.clone();
        let kill = svc_kill.clone();
        async move {
            req.extensions_mut().insert(peer);
            req.extensions_mut().insert(ConnectionKill(kill));
            Ok::<_, Infallible>(dispatch::handle(server, req, secure).await)
        }
    });

    let mut http = http1::Builder::new();
    http.keep_alive(true);
    let conn = http.serve_connection(io, svc);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(error) = result {
                debug!(%peer, %error, "connection ended with error");
            }
        }
        // unknown-host policy: drop the transport without a response
        _ = kill.notified() => {
            debug!(%peer, "connection destroyed");
        }
    }
}
