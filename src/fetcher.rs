use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Proxy, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::form_urlencoded::byte_serialize;

use crate::config::UpstreamConfig;
use crate::models::{AvailabilityState, FetchError, FetchResult, Observation, Target};
use crate::proxy_pool::ProxyRoute;

/// One availability query against the vendor, through the given route.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &Target, route: &ProxyRoute) -> FetchResult;
}

pub struct HttpFetcher {
    settings: UpstreamConfig,
    headers: HeaderMap,
    clients: RwLock<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new(settings: UpstreamConfig) -> crate::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| crate::AppError::Validation(format!("header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| crate::AppError::Validation(format!("header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            settings,
            headers,
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub fn request_url(&self, target: &Target) -> String {
        let product: String = byte_serialize(target.product_id.as_bytes()).collect();
        let location: String = byte_serialize(target.location_id.as_bytes()).collect();
        self.settings
            .endpoint
            .replace("{product}", &product)
            .replace("{location}", &location)
    }

    async fn client_for(&self, route: &ProxyRoute) -> Result<Client, FetchError> {
        if let Some(client) = self.clients.read().await.get(&route.id) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(self.settings.timeout())
            .user_agent(self.settings.user_agent.clone())
            .default_headers(self.headers.clone());
        if let Some(proxy_url) = &route.proxy_url {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| FetchError::transport(format!("invalid proxy {}: {}", route.id, e)))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::transport(format!("client for {}: {}", route.id, e)))?;

        self.clients
            .write()
            .await
            .entry(route.id.clone())
            .or_insert(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &Target, route: &ProxyRoute) -> FetchResult {
        let client = self.client_for(route).await?;
        let url = self.request_url(target);
        debug!(target_id = %target.id(), route = %route.id, "Fetching availability");

        let response = client.get(&url).send().await.map_err(classify_transport)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(target_id = %target.id(), route = %route.id, %status, "Upstream throttled request");
            return Err(FetchError::rate_limited(retry_after));
        }

        if !status.is_success() {
            return Err(FetchError::upstream(format!("unexpected status code: {}", status)));
        }

        let body = response.text().await.map_err(classify_transport)?;
        let state = parse_availability(&body, target)?;
        Ok(Observation::now(state))
    }
}

fn classify_transport(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::transport(format!("request timed out: {}", error))
    } else if error.is_connect() {
        FetchError::transport(format!("connection failed: {}", error))
    } else {
        FetchError::transport(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct FulfillmentBody {
    content: FulfillmentContent,
}

#[derive(Debug, Deserialize)]
struct FulfillmentContent {
    #[serde(rename = "pickupMessage")]
    pickup_message: PickupMessage,
}

#[derive(Debug, Deserialize)]
struct PickupMessage {
    #[serde(default)]
    stores: Vec<StoreAvailability>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoreAvailability {
    #[serde(rename = "storeNumber")]
    store_number: String,
    #[serde(rename = "partsAvailability", default)]
    parts_availability: HashMap<String, PartAvailability>,
}

#[derive(Debug, Deserialize)]
struct PartAvailability {
    #[serde(rename = "pickupDisplay")]
    pickup_display: String,
}

/// Reads the availability of `target` out of a fulfillment response body.
///
/// Any deviation from the expected shape is a parse error; the vendor's own
/// failure reports are upstream errors.
pub fn parse_availability(body: &str, target: &Target) -> Result<AvailabilityState, FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::parse(format!("invalid JSON: {}", e)))?;

    let status = match value.pointer("/head/status") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(FetchError::parse("missing head.status")),
    };
    if status != "200" {
        return Err(FetchError::upstream(format!("head.status {}", status)));
    }

    let body = value
        .get("body")
        .ok_or_else(|| FetchError::parse("missing body"))?;
    let body = FulfillmentBody::deserialize(body)
        .map_err(|e| FetchError::parse(format!("unexpected body: {}", e)))?;
    let pickup = body.content.pickup_message;

    if let Some(message) = pickup.error_message.filter(|m| !m.trim().is_empty()) {
        return Err(FetchError::upstream(message));
    }

    let store = pickup
        .stores
        .iter()
        .find(|s| s.store_number == target.location_id)
        .ok_or_else(|| FetchError::parse(format!("store {} not in response", target.location_id)))?;

    let part = store
        .parts_availability
        .get(&target.product_id)
        .ok_or_else(|| FetchError::parse(format!("product {} not in store {}", target.product_id, store.store_number)))?;

    match part.pickup_display.as_str() {
        "available" => Ok(AvailabilityState::Available),
        "unavailable" | "ineligible" => Ok(AvailabilityState::Unavailable),
        other => Err(FetchError::parse(format!("unknown pickupDisplay '{}'", other))),
    }
}
