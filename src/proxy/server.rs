use std::net::SocketAddr;

use anyhow::{Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::io_util::write_all_with_timeout;

use super::http::HttpResponse;
use super::http::body::BodyPlan;
use super::http::codec::{
    HeaderAccumulator, RequestLine, parse_request_line, read_line_with_timeout,
};
use super::request::ProxyRequest;
use super::{AppContext, connect, dispatch};

/// Serves one plain client connection: absolute-form requests are proxied
/// directly; a CONNECT hands the stream over to the TLS bump.
pub async fn serve_plain(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        let read = read_line_with_timeout(
            &mut reader,
            &mut line,
            app.settings.client_timeout,
            app.settings.max_header_size,
            "reading request line from client",
        )
        .await?;
        if read == 0 {
            return Ok(());
        }
        let request_line = parse_request_line(&line)?;

        if request_line.method == Method::CONNECT {
            // Drain the CONNECT headers, then let the MITM layer negotiate.
            let mut accumulator = HeaderAccumulator::new(app.settings.max_header_size);
            read_headers(&mut reader, &mut accumulator, &app).await?;
            let target = connect::parse_connect_target(&request_line.target)?;
            return connect::bump(reader, peer, target, app).await;
        }

        let keep_alive = handle_request(&mut reader, request_line, &app, None, peer).await?;
        if !keep_alive {
            reader.get_mut().shutdown().await.ok();
            return Ok(());
        }
    }
}

/// Serves intercepted requests over a bumped TLS session. Requests arrive
/// in origin form; the CONNECT authority supplies scheme and host.
pub async fn serve_bumped<S>(
    stream: S,
    peer: SocketAddr,
    app: AppContext,
    authority: (String, u16),
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        let read = read_line_with_timeout(
            &mut reader,
            &mut line,
            app.settings.client_timeout,
            app.settings.max_header_size,
            "reading request line from bumped client",
        )
        .await?;
        if read == 0 {
            return Ok(());
        }
        let request_line = parse_request_line(&line)?;
        if request_line.method == Method::CONNECT {
            bail!("nested CONNECT inside a bumped session from {peer}");
        }

        let keep_alive =
            handle_request(&mut reader, request_line, &app, Some(&authority), peer).await?;
        if !keep_alive {
            reader.get_mut().shutdown().await.ok();
            return Ok(());
        }
    }
}

async fn read_headers<S>(
    reader: &mut BufReader<S>,
    accumulator: &mut HeaderAccumulator,
    app: &AppContext,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut line,
            app.settings.client_timeout,
            app.settings.max_header_size,
            "reading request headers from client",
        )
        .await?;
        ensure!(read > 0, "unexpected EOF in request headers");
        if !accumulator.push_line(&line)? {
            return Ok(());
        }
    }
}

fn build_request_uri(
    request_line: &RequestLine,
    tls_authority: Option<&(String, u16)>,
    host_header: Option<&str>,
) -> Result<Uri> {
    if request_line.target.starts_with('/') {
        let (scheme, authority) = match tls_authority {
            Some((host, port)) => ("https", format!("{host}:{port}")),
            None => (
                "http",
                host_header
                    .ok_or_else(|| anyhow!("origin-form request without Host header"))?
                    .to_string(),
            ),
        };
        return Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(request_line.target.as_str())
            .build()
            .map_err(|err| anyhow!("failed to build request URI: {err}"));
    }

    let uri: Uri = request_line
        .target
        .parse()
        .map_err(|err| anyhow!("invalid request target '{}': {err}", request_line.target))?;
    ensure!(
        uri.scheme_str().is_some() && uri.host().is_some(),
        "proxy requests must use absolute-form targets"
    );
    Ok(uri)
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    request_line: RequestLine,
    app: &AppContext,
    tls_authority: Option<&(String, u16)>,
    peer: SocketAddr,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut accumulator = HeaderAccumulator::new(app.settings.max_header_size);
    read_headers(reader, &mut accumulator, app).await?;

    let uri = match build_request_uri(&request_line, tls_authority, accumulator.host()) {
        Ok(uri) => uri,
        Err(err) => {
            debug!(peer = %peer, error = %err, "rejecting malformed request");
            let resp =
                HttpResponse::synthetic(StatusCode::BAD_REQUEST, err.to_string().into_bytes());
            return write_response(reader, resp, true, app).await;
        }
    };

    if accumulator.is_chunked() {
        let resp = HttpResponse::synthetic(
            StatusCode::NOT_IMPLEMENTED,
            b"chunked request bodies are not supported".to_vec(),
        );
        return write_response(reader, resp, true, app).await;
    }

    let body = match accumulator.content_length()? {
        Some(length) => {
            if length as usize > app.settings.max_request_body_size {
                let resp = HttpResponse::synthetic(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    b"request body exceeds configured limit".to_vec(),
                );
                return write_response(reader, resp, true, app).await;
            }
            let mut body = vec![0u8; length as usize];
            timeout(app.settings.client_timeout, reader.read_exact(&mut body))
                .await
                .map_err(|_| anyhow!("timed out reading request body from {peer}"))??;
            body
        }
        None => Vec::new(),
    };

    let req = ProxyRequest::new(
        request_line.method,
        uri,
        accumulator.end_to_end_header_map(),
        body,
    )?;
    let resp = dispatch::dispatch(app, &req).await;
    let client_close = accumulator.wants_connection_close();
    write_response(reader, resp, client_close, app).await
}

/// Writes the response head and body to the client. Returns whether the
/// connection may be reused.
async fn write_response<S>(
    reader: &mut BufReader<S>,
    resp: HttpResponse,
    client_close: bool,
    app: &AppContext,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let plan = resp.body.plan();
    let close = client_close || matches!(plan, BodyPlan::UntilClose);
    let head_bytes = resp.head.encode(plan, close);
    let stream = reader.get_mut();
    write_all_with_timeout(
        stream,
        &head_bytes,
        app.settings.client_timeout,
        "writing response head to client",
    )
    .await?;
    resp.body
        .write_to(
            stream,
            app.settings.client_timeout,
            "writing response body to client",
        )
        .await?;
    crate::io_util::timeout_with_context(
        app.settings.client_timeout,
        stream.flush(),
        "flushing response to client",
    )
    .await?;
    Ok(!close)
}
