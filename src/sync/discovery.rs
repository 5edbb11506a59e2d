use crate::error::AppError;
use crate::sync::types::{DiscoveryConfig, EngineConfig};
use reqwest::Client;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const TUNNEL_CONFIG_PATH: &str = "/rest/v1/tunnel_config";
const API_KEY_HEADER: &str = "apikey";

pub type PeerWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn tunnel_config_endpoint(base_url: &str, service_name: &str) -> String {
    format!("{base_url}{TUNNEL_CONFIG_PATH}")
        + &format!("?service_name=eq.{service_name}&select=ws_url,wss_url")
}

#[derive(Debug, Deserialize)]
struct TunnelConfigWire {
    #[serde(default)]
    ws_url: Option<String>,
    #[serde(default)]
    wss_url: Option<String>,
}

fn select_published_address(rows: Vec<TunnelConfigWire>, secure: bool) -> Option<String> {
    let first = rows.into_iter().next()?;
    let candidate = if secure { first.wss_url } else { first.ws_url };
    candidate
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

pub async fn fetch_published_address(
    client: &Client,
    discovery: &DiscoveryConfig,
    secure: bool,
) -> Result<Option<String>, AppError> {
    let endpoint = tunnel_config_endpoint(&discovery.base_url, &discovery.service_name);
    let response = client
        .get(endpoint)
        .header(API_KEY_HEADER, &discovery.api_key)
        .timeout(discovery.timeout)
        .send()
        .await?
        .error_for_status()?;
    let rows = response.json::<Vec<TunnelConfigWire>>().await?;
    Ok(select_published_address(rows, secure))
}

/// Resolves the live endpoint. Never fails: any discovery problem falls back to
/// the static address.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    client: Client,
    discovery: Option<DiscoveryConfig>,
    fallback_url: String,
    secure: bool,
}

impl EndpointResolver {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            discovery: config.discovery.clone(),
            fallback_url: config.fallback_url.clone(),
            secure: config.secure_transport,
        }
    }

    pub async fn resolve(&self) -> String {
        let Some(discovery) = &self.discovery else {
            return self.fallback_url.clone();
        };

        match fetch_published_address(&self.client, discovery, self.secure).await {
            Ok(Some(url)) => {
                log::info!("resolved published endpoint {url}");
                url
            }
            Ok(None) => {
                log::warn!(
                    "no published endpoint for service '{}', using fallback {}",
                    discovery.service_name,
                    self.fallback_url
                );
                self.fallback_url.clone()
            }
            Err(error) => {
                log::warn!(
                    "endpoint discovery failed ({error}), using fallback {}",
                    self.fallback_url
                );
                self.fallback_url.clone()
            }
        }
    }
}

pub async fn connect_peer_stream(endpoint: &str) -> Result<PeerWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
    Ok(stream)
}
