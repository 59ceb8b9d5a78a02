use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::REFERER;
use reqwest::redirect::Policy;
use reqwest::{Method, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancellable, Detail, PingResult, Probe, Reply};
use crate::error::PingError;
use crate::resolver::{Resolve, Target};

pub const DEFAULT_USER_AGENT: &str = "pping";

/// Times one HTTP request and the full response body.
#[derive(Debug)]
pub struct HttpProbe {
    method: Method,
    url: Url,
    target: Target,
    timeout: Duration,
    pub disable_http2: bool,
    pub disable_compression: bool,
    pub insecure: bool,
    pub referrer: Option<String>,
    pub user_agent: String,
}

impl HttpProbe {
    /// `url` without a scheme is treated as `http://`.
    pub fn new(
        method: &str,
        url: &str,
        timeout: Duration,
        resolver: std::sync::Arc<dyn Resolve>,
        ip: Option<IpAddr>,
    ) -> Result<Self, PingError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| PingError::protocol(format!("invalid method {:?}", method)))?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        let url = Url::parse(&url).map_err(PingError::protocol)?;
        let host = url
            .host_str()
            .ok_or_else(|| PingError::protocol(format!("{} has no host", url)))?
            .to_string();

        Ok(Self {
            method,
            target: Target::new(host, resolver).pin(ip),
            url,
            timeout,
            disable_http2: false,
            disable_compression: false,
            insecure: false,
            referrer: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn client(&self, ip: IpAddr) -> Result<reqwest::Client, PingError> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(0)
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .danger_accept_invalid_certs(self.insecure)
            .user_agent(self.user_agent.clone());
        if self.disable_http2 {
            builder = builder.http1_only();
        }
        if self.disable_compression {
            builder = builder.no_gzip().no_brotli().no_deflate();
        }
        if !self.target.is_pinned() || self.url.host_str() != Some(&ip.to_string()) {
            // Keep Host and SNI as the URL's host while dialing the chosen
            // address. The port in the override is ignored.
            builder = builder.resolve(self.target.host(), SocketAddr::new(ip, 0));
        }
        builder.build().map_err(|e| PingError::Transport(e.to_string()))
    }
}

fn classify(err: reqwest::Error) -> PingError {
    if err.is_timeout() {
        PingError::Timeout
    } else if err.is_connect() {
        PingError::Transport(error_chain(&err))
    } else if err.is_builder() || err.is_decode() {
        PingError::Protocol(error_chain(&err))
    } else {
        PingError::Transport(error_chain(&err))
    }
}

// reqwest's top-level message hides the cause ("error sending request").
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl Probe for HttpProbe {
    async fn ping_context(&mut self, cancel: &CancellationToken) -> PingResult {
        let ip = cancellable(cancel, self.target.address()).await?;
        let client = self.client(ip)?;

        let mut request = client.request(self.method.clone(), self.url.clone());
        if let Some(referrer) = &self.referrer {
            request = request.header(REFERER, referrer);
        }

        let started = Instant::now();
        let (protocol, status, length) = cancellable(cancel, async {
            let response = request.send().await.map_err(classify)?;
            let protocol = format!("{:?}", response.version());
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(classify)?;
            Ok((protocol, status, body.len()))
        })
        .await?;
        let elapsed = started.elapsed();

        debug!("{} {} answered {} in {:?}", self.method, self.url, status, elapsed);
        Ok(Reply::new(
            ip,
            elapsed,
            Detail::Http {
                protocol,
                status,
                length,
            },
        ))
    }
}
