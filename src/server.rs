//! DNS server setup and lifecycle management.

use hickory_server::authority::Catalog;
use hickory_server::ServerFuture;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{DnsConfig, RuleConfig};
use crate::error::DnsError;
use crate::handler::TemplateHandler;
use crate::rules;
use crate::template::FunctionTable;

/// DNS server answering from template rules, with an empty catalog behind
/// them for everything the rules do not claim.
pub struct DnsServer {
    config: DnsConfig,
    handler: TemplateHandler<Catalog>,
}

impl DnsServer {
    /// Compile `rules` and create a server. Fails on any invalid rule.
    pub fn new(config: DnsConfig, rules: &[RuleConfig]) -> Result<Self, DnsError> {
        let (resolver, renderer) =
            rules::build(rules, config.policy, FunctionTable::with_builtins())?;
        let handler = TemplateHandler::new(resolver, renderer, Catalog::new());
        Ok(Self { config, handler })
    }

    /// The request handler, for callers that drive hickory themselves.
    pub fn handler(&self) -> &TemplateHandler<Catalog> {
        &self.handler
    }

    /// Run the DNS server until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DnsError> {
        let listen_addr = self.config.listen_addr;
        info!(
            %listen_addr,
            policy = %self.handler.resolver().policy(),
            rules = self.handler.resolver().rule_count(),
            "Starting template-dns server"
        );

        let mut server = ServerFuture::new(self.handler);

        let udp_socket = UdpSocket::bind(listen_addr).await?;
        info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(listen_addr).await?;
        info!(addr = %tcp_listener.local_addr()?, "DNS TCP listening");
        server.register_listener(
            tcp_listener,
            Duration::from_secs(self.config.tcp_timeout_secs),
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        info!("DNS server stopped");
        Ok(())
    }
}
