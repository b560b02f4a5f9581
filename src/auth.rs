//! Signed REST handshake that hands out the MQTT credentials for the feed.
//!
//! Requests to the EcoFlow open API carry `accessKey`, `nonce` and
//! `timestamp` headers plus `sign`, the hex HMAC-SHA256 of the sorted
//! `key=value` pairs keyed with the secret.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow, bail};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

const CERTIFICATION_PATH: &str = "/iot-open/sign/certification";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Broker account issued by the certification endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttCertificate {
    pub account: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct CertificationResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<CertificationData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificationData {
    certificate_account: String,
    certificate_password: String,
    url: String,
    port: PortField,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn signature(secret: &str, message: &str) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("secret key is not usable as an HMAC key: {}", e))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `params` plus their `sign` entry.
pub fn sign_params(
    params: &BTreeMap<String, String>,
    secret: &str,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut signed = params.clone();
    signed.insert("sign".to_string(), signature(secret, &canonical_query(params))?);
    Ok(signed)
}

pub fn parse_certificate_response(body: &str) -> anyhow::Result<MqttCertificate> {
    let response: CertificationResponse =
        serde_json::from_str(body).context("certification response is not valid JSON")?;
    if response.code != "0" {
        bail!(
            "certification refused with code {}: {}",
            response.code,
            response.message.unwrap_or_default()
        );
    }
    let Some(data) = response.data else {
        bail!("certification response has no data");
    };

    let port = match data.port {
        PortField::Number(port) => port,
        PortField::Text(text) => text
            .trim()
            .parse()
            .with_context(|| format!("broker port {:?} is not a number", text))?,
    };

    Ok(MqttCertificate {
        account: data.certificate_account,
        password: data.certificate_password,
        host: data.url,
        port,
    })
}

/// Ask the open API for the broker account of `api.access_key`.
pub async fn fetch_certificate(api: &ApiCredentials) -> anyhow::Result<MqttCertificate> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let nonce = rand::rng().random_range(10000..1000000);

    let params = BTreeMap::from([
        ("accessKey".to_string(), api.access_key.clone()),
        ("nonce".to_string(), nonce.to_string()),
        ("timestamp".to_string(), timestamp.to_string()),
    ]);
    let headers = sign_params(&params, &api.secret_key)?;

    let url = format!("{}{}", api.host.trim_end_matches('/'), CERTIFICATION_PATH);
    info!("Requesting MQTT certificate from {}", url);

    let mut request = reqwest::Client::new().get(&url);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let body = request
        .send()
        .await
        .with_context(|| format!("request to {} failed", url))?
        .error_for_status()?
        .text()
        .await?;
    debug!("Certification response: {}", body);

    parse_certificate_response(&body)
}
