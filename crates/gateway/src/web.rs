//! HTTPS interceptor.
//!
//! Serves TLS on the configured port with the generated certificate.
//! The bootstrap endpoint (`/growtopia/server_data.php`) is forwarded
//! upstream across a candidate host list, its response rewritten to
//! point the client at the proxy's own UDP listener, and the discovered
//! real endpoint published into the relay loop. Every other request is
//! reverse-proxied as-is, minus hop-by-hop headers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use growgate_core::config::Config;
use growgate_core::text::TextRecord;

use crate::relay::{EndpointUpdates, PendingEndpoint};
use crate::resolver::Resolver;
use crate::tls::INTERCEPT_DOMAINS;

const BOOTSTRAP_PATH: &str = "/growtopia/server_data.php";
const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(2500);
const MAX_IPS_PER_HOST: usize = 2;
const MAX_BODY: usize = 1 << 20;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
pub struct WebContext {
    pub config: Arc<Config>,
    /// The UDP port advertised in rewritten bootstrap bodies.
    pub listen_port: u16,
    pub endpoints: EndpointUpdates,
    pub resolver: Arc<Resolver>,
}

pub async fn run(ctx: WebContext, tls_config: Arc<rustls::ServerConfig>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ctx.config.web.port))
        .await
        .with_context(|| format!("bind https listener on port {}", ctx.config.web.port))?;
    let acceptor = TlsAcceptor::from(tls_config);
    tracing::info!("web.listening port={}", ctx.config.web.port);

    loop {
        let (stream, peer) = listener.accept().await.context("accept https client")?;
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(acceptor, stream, ctx).await {
                tracing::debug!("web.connection_error peer={peer} error={err:#}");
            }
        });
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    ctx: WebContext,
) -> anyhow::Result<()> {
    let tls = acceptor.accept(stream).await.context("tls accept")?;
    let mut reader = BufReader::new(tls);
    let request = read_request(&mut reader).await?;
    let response = route(&request, &ctx).await;
    write_response(reader.get_mut(), &response).await
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    fn query(&self) -> &str {
        self.target
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or("")
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Host header, port stripped.
    fn host(&self) -> Option<&str> {
        self.header("host")
            .map(|host| host.split(':').next().unwrap_or(host))
    }
}

#[derive(Debug)]
struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn text(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }
}

async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<HttpRequest> {
    let mut line = String::new();
    reader.read_line(&mut line).await.context("read request line")?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .context("missing request method")?
        .to_uppercase();
    let target = parts.next().context("missing request target")?.to_string();

    let mut headers = Vec::new();
    loop {
        let mut header_line = String::new();
        let read = reader.read_line(&mut header_line).await.context("read header")?;
        if read == 0 {
            anyhow::bail!("connection closed mid-headers");
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY {
        anyhow::bail!("request body of {content_length} bytes exceeds limit");
    }
    let mut body = vec![0u8; content_length];
    if !body.is_empty() {
        reader.read_exact(&mut body).await.context("read body")?;
    }

    Ok(HttpRequest {
        method,
        target,
        headers,
        body,
    })
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &HttpResponse,
) -> anyhow::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        response.body.len()
    ));
    writer.write_all(head.as_bytes()).await.context("write head")?;
    writer.write_all(&response.body).await.context("write body")?;
    writer.flush().await.context("flush response")?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

async fn route(request: &HttpRequest, ctx: &WebContext) -> HttpResponse {
    if request.path() == BOOTSTRAP_PATH && (request.method == "POST" || request.method == "GET") {
        bootstrap(request, ctx).await
    } else {
        passthrough(request, ctx).await
    }
}

fn is_intercept_domain(host: &str) -> bool {
    INTERCEPT_DOMAINS
        .iter()
        .any(|domain| domain.eq_ignore_ascii_case(host))
}

fn dedupe_case_insensitive(hosts: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for host in hosts {
        let host = host.trim();
        if host.is_empty() {
            continue;
        }
        if !unique.iter().any(|seen| seen.eq_ignore_ascii_case(host)) {
            unique.push(host.to_string());
        }
    }
    unique
}

/// Request host first, then the configured primary, padded with the
/// fixed fallback domains.
fn bootstrap_candidates(request_host: Option<&str>, primary: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    if let Some(host) = request_host {
        hosts.push(host.to_string());
    }
    hosts.push(primary.to_string());
    hosts.extend(INTERCEPT_DOMAINS.iter().map(|domain| domain.to_string()));
    dedupe_case_insensitive(hosts)
}

/// Prefer the primary when the client addressed one of the intercept
/// domains (it is talking to "the" server), otherwise honor the
/// explicit host it asked for.
fn passthrough_candidates(request_host: Option<&str>, primary: &str) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    match request_host {
        Some(host) if is_intercept_domain(host) => {
            hosts.push(primary.to_string());
            hosts.push(host.to_string());
        }
        Some(host) => {
            hosts.push(host.to_string());
            hosts.push(primary.to_string());
        }
        None => hosts.push(primary.to_string()),
    }
    dedupe_case_insensitive(hosts)
}

/// Per-attempt client: pinned to one resolved address, SNI kept on the
/// candidate host, upstream certificate checks off.
fn upstream_client(host: &str, ip: Ipv4Addr) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(UPSTREAM_TIMEOUT)
        .resolve(host, SocketAddr::new(IpAddr::V4(ip), 443))
        .build()
        .context("build upstream client")
}

async fn bootstrap(request: &HttpRequest, ctx: &WebContext) -> HttpResponse {
    let params = if request.method == "POST" {
        String::from_utf8_lossy(&request.body).to_string()
    } else {
        request.query().to_string()
    };
    let wants_login_url = params
        .split('&')
        .chain(request.query().split('&'))
        .any(|pair| pair == "platform=0");
    let candidates = bootstrap_candidates(request.host(), &ctx.config.server.address);
    tracing::info!(
        "web.bootstrap method={} candidates={}",
        request.method,
        candidates.join(",")
    );

    for host in &candidates {
        for ip in ctx.resolver.ipv4(host, MAX_IPS_PER_HOST).await {
            match fetch_bootstrap(request, host, ip, &params).await {
                Ok(body) => {
                    if wants_login_url && !body.contains("loginurl|") {
                        tracing::warn!(
                            "web.bootstrap.rejected host={host} ip={ip} reason=missing_loginurl"
                        );
                        continue;
                    }
                    let (rewritten, endpoint) = rewrite_bootstrap(
                        &body,
                        ctx.listen_port,
                        ctx.config.web.ignore_maintenance,
                    );
                    if endpoint.is_valid() {
                        tracing::info!(
                            "web.bootstrap.discovered host={} port={}",
                            endpoint.host,
                            endpoint.port
                        );
                        ctx.endpoints.set(endpoint);
                    } else {
                        tracing::warn!("web.bootstrap.no_endpoint host={host}");
                    }
                    return HttpResponse::text(200, "text/html", rewritten);
                }
                Err(err) => {
                    tracing::warn!("web.bootstrap.attempt_failed host={host} ip={ip} error={err:#}");
                }
            }
        }
    }

    tracing::error!("web.bootstrap.exhausted candidates={}", candidates.join(","));
    HttpResponse::text(500, "text/html", "upstream discovery failed")
}

async fn fetch_bootstrap(
    request: &HttpRequest,
    host: &str,
    ip: Ipv4Addr,
    params: &str,
) -> anyhow::Result<String> {
    let client = upstream_client(host, ip)?;
    let url = if request.query().is_empty() {
        format!("https://{host}{BOOTSTRAP_PATH}")
    } else {
        format!("https://{host}{BOOTSTRAP_PATH}?{}", request.query())
    };
    let response = if request.method == "POST" {
        client
            .post(url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(params.to_string())
            .send()
            .await
    } else {
        client.get(url).send().await
    }
    .context("bootstrap request")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("upstream status {status}");
    }
    response.text().await.context("bootstrap body")
}

/// Rewrites an upstream bootstrap body: the advertised endpoint becomes
/// our loopback listener, `type`/`type2` are pinned, maintenance markers
/// are optionally stripped, and sentinel lines without a delimiter are
/// re-appended verbatim. Returns the body and the real endpoint it
/// advertised.
fn rewrite_bootstrap(
    body: &str,
    listen_port: u16,
    ignore_maintenance: bool,
) -> (String, PendingEndpoint) {
    let normalized = body
        .replace("\r\n", "\n")
        .replace("\rtype|", "\ntype|")
        .replace("\rbeta_type|", "\nbeta_type|")
        .replace("\rmeta|", "\nmeta|");
    let mut record = TextRecord::parse(&normalized);

    let endpoint = PendingEndpoint::new(
        record.get("server", 0),
        record.get_int("port", 0, 0).clamp(0, 65535) as u16,
    );

    record.set("server", ["127.0.0.1"]);
    record.set("port", [listen_port.to_string()]);
    if !record.contains("type") {
        record.set("type", ["1"]);
    }
    record.set("type2", ["1"]);
    if ignore_maintenance && record.contains("#maint") {
        record.remove("#maint");
        record.remove("maint");
    }

    let mut out = record.serialize();
    for line in normalized.lines() {
        if !line.contains('|') && !line.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(line);
        }
    }
    (out, endpoint)
}

async fn passthrough(request: &HttpRequest, ctx: &WebContext) -> HttpResponse {
    let candidates = passthrough_candidates(request.host(), &ctx.config.server.address);
    tracing::debug!(
        "web.passthrough method={} path={} candidates={}",
        request.method,
        request.path(),
        candidates.join(",")
    );

    let mut last: Option<HttpResponse> = None;
    for host in &candidates {
        for ip in ctx.resolver.ipv4(host, MAX_IPS_PER_HOST).await {
            match forward(request, host, ip).await {
                Ok(response) => {
                    let retryable =
                        matches!(response.status, 403 | 404) || response.status >= 500;
                    if !retryable {
                        return response;
                    }
                    tracing::debug!(
                        "web.passthrough.retry host={host} ip={ip} status={}",
                        response.status
                    );
                    last = Some(response);
                }
                Err(err) => {
                    tracing::warn!(
                        "web.passthrough.attempt_failed host={host} ip={ip} error={err:#}"
                    );
                }
            }
        }
    }
    last.unwrap_or_else(|| HttpResponse::text(502, "text/plain", "upstream unreachable"))
}

async fn forward(request: &HttpRequest, host: &str, ip: Ipv4Addr) -> anyhow::Result<HttpResponse> {
    let client = upstream_client(host, ip)?;
    let method =
        reqwest::Method::from_bytes(request.method.as_bytes()).context("request method")?;
    let url = if request.query().is_empty() {
        format!("https://{host}{}", request.path())
    } else {
        format!("https://{host}{}?{}", request.path(), request.query())
    };

    let mut outbound = client.request(method, url);
    for (name, value) in &request.headers {
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        outbound = outbound.header(name.as_str(), value.as_str());
    }
    let response = outbound
        .body(request.body.clone())
        .send()
        .await
        .context("forward request")?;

    let status = response.status().as_u16();
    let mut headers = Vec::new();
    for (name, value) in response.headers() {
        let name = name.as_str();
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    let body = response.bytes().await.context("forward body")?.to_vec();
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|header| header.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_discovery_rewrite() {
        let body = "server|1.2.3.4\nport|17091\ntype|1\nloginurl|https://x\n";
        let (rewritten, endpoint) = rewrite_bootstrap(body, 16999, false);
        assert_eq!(endpoint, PendingEndpoint::new("1.2.3.4", 17091));
        let record = TextRecord::parse(&rewritten);
        assert_eq!(record.get("server", 0), "127.0.0.1");
        assert_eq!(record.get("port", 0), "16999");
        assert_eq!(record.get("type", 0), "1");
        assert_eq!(record.get("type2", 0), "1");
        assert_eq!(record.get("loginurl", 0), "https://x");
    }

    #[test]
    fn crlf_and_inline_cr_fixups_normalize() {
        let body = "server|1.2.3.4\r\nport|17091\rtype|1\rbeta_type|0\rmeta|abc\r\n";
        let (rewritten, endpoint) = rewrite_bootstrap(body, 16999, false);
        assert_eq!(endpoint.port, 17091);
        let record = TextRecord::parse(&rewritten);
        assert_eq!(record.get("type", 0), "1");
        assert_eq!(record.get("beta_type", 0), "0");
        assert_eq!(record.get("meta", 0), "abc");
    }

    #[test]
    fn missing_type_line_is_added() {
        let (rewritten, _) = rewrite_bootstrap("server|a\nport|1\n", 16999, false);
        let record = TextRecord::parse(&rewritten);
        assert_eq!(record.get("type", 0), "1");
        assert_eq!(record.get("type2", 0), "1");
    }

    #[test]
    fn existing_type_value_is_kept() {
        let (rewritten, _) = rewrite_bootstrap("server|a\nport|1\ntype|2\n", 16999, false);
        let record = TextRecord::parse(&rewritten);
        assert_eq!(record.get("type", 0), "2");
    }

    #[test]
    fn maintenance_lines_are_stripped_when_ignored() {
        let body = "#maint|hello\nserver|a\nport|1\ntype|1\nmaint|down for a bit\n";
        let (rewritten, _) = rewrite_bootstrap(body, 16999, true);
        let record = TextRecord::parse(&rewritten);
        assert!(!record.contains("#maint"));
        assert!(!record.contains("maint"));
        assert_eq!(record.get("server", 0), "127.0.0.1");
        assert_eq!(record.get("port", 0), "16999");
    }

    #[test]
    fn maintenance_lines_survive_by_default() {
        let body = "#maint|hello\nserver|a\nport|1\ntype|1\n";
        let (rewritten, _) = rewrite_bootstrap(body, 16999, false);
        assert!(TextRecord::parse(&rewritten).contains("#maint"));
    }

    #[test]
    fn sentinel_lines_are_reappended() {
        let body = "server|a\nport|1\ntype|1\nRTENDMARKERBS1001";
        let (rewritten, _) = rewrite_bootstrap(body, 16999, false);
        assert!(rewritten.ends_with("RTENDMARKERBS1001"));
    }

    #[test]
    fn invalid_upstream_endpoint_is_flagged() {
        let (_, endpoint) = rewrite_bootstrap("type|1\n", 16999, false);
        assert!(!endpoint.is_valid());
    }

    #[test]
    fn bootstrap_candidates_dedupe_and_pad() {
        let candidates = bootstrap_candidates(Some("WWW.GROWTOPIA1.COM"), "www.growtopia1.com");
        assert_eq!(candidates[0], "WWW.GROWTOPIA1.COM");
        // Case-insensitive duplicate of the primary is gone; the other
        // fallback domains pad the tail.
        assert!(candidates
            .iter()
            .skip(1)
            .all(|host| !host.eq_ignore_ascii_case("www.growtopia1.com")));
        assert!(candidates.iter().any(|host| host == "growtopia2.com"));
    }

    #[test]
    fn passthrough_prefers_primary_for_intercept_hosts() {
        let candidates = passthrough_candidates(Some("growtopia2.com"), "gt.example.net");
        assert_eq!(candidates[0], "gt.example.net");
        assert_eq!(candidates[1], "growtopia2.com");

        let candidates = passthrough_candidates(Some("cdn.example.org"), "gt.example.net");
        assert_eq!(candidates[0], "cdn.example.org");
        assert_eq!(candidates[1], "gt.example.net");
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        for header in ["Connection", "TRANSFER-ENCODING", "upgrade", "te"] {
            assert!(is_hop_by_hop(header));
        }
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-forwarded-for"));
    }
}
