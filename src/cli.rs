use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::icmp::packet::MAX_PAYLOAD_LEN;
use crate::icmp::IcmpProbe;
use crate::probe::{DnsProbe, DnsTransport, HttpProbe, Probe, QuicProbe, TcpProbe, TlsProbe, TlsVersion};
use crate::resolver::{AddressFamily, SystemResolver, Target};
use crate::runner::RunConfig;

#[derive(Parser, Debug)]
#[command(name = "pping", author, version, about, long_about = None)]
pub struct Cli {
    /// Ping the target until stopped
    #[arg(short = 't', long, global = true)]
    pub infinite: bool,

    /// Number of requests to send
    #[arg(short = 'c', long, default_value_t = 4, global = true)]
    pub count: u64,

    /// Delay between requests, e.g. 500ms or 2s
    #[arg(short = 'i', long, default_value = "1s", value_parser = humantime::parse_duration, global = true)]
    pub interval: Duration,

    /// Use IPv4 only
    #[arg(short = '4', long, global = true)]
    pub ipv4: bool,

    /// Use IPv6 only
    #[arg(short = '6', long, global = true)]
    pub ipv6: bool,

    /// More log output on stderr (-v, -vv)
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Time TCP connection setup
    Tcp(TcpArgs),
    /// Time TCP connection setup and TLS handshake
    Tls(TlsArgs),
    /// Time an HTTP request
    Http(HttpArgs),
    /// Time a DNS query
    Dns(DnsArgs),
    /// Time a QUIC handshake
    Quic(QuicArgs),
    /// Send ICMP echo requests
    Icmp(IcmpArgs),
}

#[derive(Args, Debug)]
pub struct TcpArgs {
    pub host: String,
    /// Address to use instead of resolving the host
    pub ip: Option<String>,
    #[arg(short = 'p', long, default_value_t = 80)]
    pub port: u16,
    #[arg(short = 'w', long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct TlsArgs {
    pub host: String,
    /// Address to use instead of resolving the host
    pub ip: Option<String>,
    #[arg(short = 'p', long, default_value_t = 443)]
    pub port: u16,
    /// Connection timeout
    #[arg(short = 'w', long = "connection", default_value = "4s", value_parser = humantime::parse_duration)]
    pub connection_timeout: Duration,
    /// Handshake timeout
    #[arg(short = 'x', long = "handshake", default_value = "10s", value_parser = humantime::parse_duration)]
    pub handshake_timeout: Duration,
    /// TLS version, 13 or 12
    #[arg(short = 's', long = "tlsversion")]
    pub tls_version: Option<String>,
    /// Allow insecure server connections
    #[arg(short = 'k', long)]
    pub insecure: bool,
}

#[derive(Args, Debug)]
pub struct HttpArgs {
    pub url: String,
    /// Address to use instead of resolving the host
    pub ip: Option<String>,
    #[arg(short = 'm', long, default_value = "GET")]
    pub method: String,
    #[arg(short = 'w', long, default_value = "4s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Disable HTTP/2
    #[arg(short = 'd', long = "nohttp2")]
    pub no_http2: bool,
    /// Disable compression
    #[arg(short = 'x', long = "nocompression")]
    pub no_compression: bool,
    /// Allow insecure server connections
    #[arg(short = 'k', long)]
    pub insecure: bool,
    /// Referer header
    #[arg(short = 'r', long)]
    pub referrer: Option<String>,
    /// User-Agent header
    #[arg(short = 'u', long = "useragent")]
    pub user_agent: Option<String>,
}

#[derive(Args, Debug)]
pub struct DnsArgs {
    pub host: String,
    /// Port, 0 for the transport's default
    #[arg(short = 'p', long, default_value_t = 0)]
    pub port: u16,
    #[arg(short = 'w', long, default_value = "4s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Use TCP
    #[arg(long)]
    pub tcp: bool,
    /// Use DNS-over-TLS
    #[arg(long)]
    pub tls: bool,
    /// Record type: A, AAAA, NS, ...
    #[arg(long = "type", default_value = "NS")]
    pub record_type: String,
    #[arg(long, default_value = ".")]
    pub domain: String,
    /// Allow insecure server connections
    #[arg(short = 'k', long)]
    pub insecure: bool,
}

#[derive(Args, Debug)]
pub struct QuicArgs {
    pub host: String,
    /// Address to use instead of resolving the host
    pub ip: Option<String>,
    #[arg(short = 'p', long, default_value_t = 443)]
    pub port: u16,
    #[arg(short = 'w', long, default_value = "4s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Allow insecure server connections
    #[arg(short = 'k', long)]
    pub insecure: bool,
    #[arg(short = 'a', long, default_value = "h3")]
    pub alpn: String,
}

#[derive(Args, Debug)]
pub struct IcmpArgs {
    pub host: String,
    #[arg(short = 'w', long, default_value = "4s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
    /// Use a raw socket
    #[arg(short = 'p', long)]
    pub privileged: bool,
    /// Time to live of outgoing requests
    #[arg(short = 'l', long)]
    pub ttl: Option<u8>,
    /// Payload size in bytes
    #[arg(short = 's', long, value_parser = clap::value_parser!(u16).range(1..=MAX_PAYLOAD_LEN as i64))]
    pub size: Option<u16>,
}

/// Everything `main` needs to start a run.
pub struct Plan {
    pub run: RunConfig,
    pub probe: Box<dyn Probe>,
    /// Printed before the first round.
    pub banner: String,
}

fn parse_ip(ip: Option<&str>) -> Result<Option<IpAddr>> {
    ip.map(|s| s.parse::<IpAddr>().map_err(|_| anyhow!("parse IP failed: {}", s)))
        .transpose()
}

impl Cli {
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            count: self.count,
            infinite: self.infinite,
            interval: self.interval,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::from_flags(self.ipv4, self.ipv6)
    }

    /// Build the probe for the chosen subcommand.
    pub fn plan(&self) -> Result<Plan> {
        let resolver = SystemResolver::shared(self.family());
        let (probe, banner): (Box<dyn Probe>, String) = match &self.command {
            Command::Tcp(args) => {
                let ip = parse_ip(args.ip.as_deref())?;
                let target = Target::new(&args.host, resolver).pin(ip);
                (
                    Box::new(TcpProbe::new(target, args.port, args.timeout)),
                    format!("Ping {} ({}):", args.host, args.port),
                )
            }
            Command::Tls(args) => {
                let ip = parse_ip(args.ip.as_deref())?;
                let version = args
                    .tls_version
                    .as_deref()
                    .map(str::parse::<TlsVersion>)
                    .transpose()
                    .map_err(|e| anyhow!(e))?;
                let target = Target::new(&args.host, resolver).pin(ip);
                let probe = TlsProbe::new(
                    target,
                    args.port,
                    args.connection_timeout,
                    args.handshake_timeout,
                    version,
                    args.insecure,
                )?;
                (Box::new(probe), format!("Ping {} ({}):", args.host, args.port))
            }
            Command::Http(args) => {
                let ip = parse_ip(args.ip.as_deref())?;
                let mut probe = HttpProbe::new(&args.method, &args.url, args.timeout, resolver, ip)?;
                probe.disable_http2 = args.no_http2;
                probe.disable_compression = args.no_compression;
                probe.insecure = args.insecure;
                probe.referrer = args.referrer.clone().filter(|r| !r.is_empty());
                if let Some(ua) = args.user_agent.as_deref().filter(|ua| !ua.is_empty()) {
                    probe.user_agent = ua.to_string();
                }
                let banner = format!("Ping {}:", probe.url());
                (Box::new(probe), banner)
            }
            Command::Dns(args) => {
                let transport = if args.tls {
                    DnsTransport::Tls
                } else if args.tcp {
                    DnsTransport::Tcp
                } else {
                    DnsTransport::Udp
                };
                let target = Target::new(&args.host, resolver);
                let probe = DnsProbe::new(
                    target,
                    args.port,
                    args.timeout,
                    transport,
                    &args.record_type,
                    &args.domain,
                    args.insecure,
                )
                .context("invalid dns query")?;
                let banner = format!("Ping {}://{}:", transport, join_host_port(&args.host, probe.port()));
                (Box::new(probe), banner)
            }
            Command::Quic(args) => {
                let ip = parse_ip(args.ip.as_deref())?;
                let target = Target::new(&args.host, resolver).pin(ip);
                let probe = QuicProbe::new(target, args.port, args.timeout, Some(&args.alpn), args.insecure)?;
                (Box::new(probe), format!("Ping {} ({}):", args.host, args.port))
            }
            Command::Icmp(args) => {
                let target = Target::new(&args.host, resolver);
                let probe = IcmpProbe::new(target, args.timeout, args.privileged)
                    .with_ttl(args.ttl.filter(|ttl| *ttl > 0))
                    .with_size(args.size.map(usize::from));
                (Box::new(probe), format!("Ping {}:", args.host))
            }
        };

        Ok(Plan {
            run: self.run_config(),
            probe,
            banner,
        })
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
