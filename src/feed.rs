//! EcoFlow open-API MQTT feed.
//!
//! The PowerStream publishes its "quota" (current state) on
//! `/open/{account}/{serial}/quota`. Each message carrying `invOutputWatts`
//! becomes a [`PowerSample`] on a single-slot watch channel, so the consumer
//! always sees the most recent value and never a backlog.

use std::sync::Arc;

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::auth::MqttCertificate;
use crate::encoder::PowerSample;
use crate::error::FeedError;
use crate::traits::HandleSample;

const OUTPUT_WATTS_FIELD: &str = "invOutputWatts";
// invOutputWatts is reported in tenths of a watt
const DECIWATTS_PER_WATT: f64 = 10.0;

pub type SampleSender = watch::Sender<Option<PowerSample>>;
pub type SampleReceiver = watch::Receiver<Option<PowerSample>>;

pub fn sample_channel() -> (SampleSender, SampleReceiver) {
    watch::channel(None)
}

pub fn quota_topic(account: &str, serial_number: &str) -> String {
    format!("/open/{}/{}/quota", account, serial_number)
}

/// Extract the inverter output power in W from a quota message.
///
/// Returns `Ok(None)` for quota messages that report other parameters.
pub fn parse_quota_payload(payload: &[u8]) -> Result<Option<f64>, FeedError> {
    let json: Value = serde_json::from_slice(payload)?;
    let Some(raw) = json.get("param").and_then(|param| param.get(OUTPUT_WATTS_FIELD)) else {
        return Ok(None);
    };

    let deciwatts = match raw {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| FeedError::NotANumber {
        field: OUTPUT_WATTS_FIELD,
        value: raw.to_string(),
    })?;

    Ok(Some(deciwatts / DECIWATTS_PER_WATT))
}

pub struct EcoflowFeed {
    client: AsyncClient,
    shutdown: Arc<Notify>,
    _eventloop_handle: task::JoinHandle<()>,
}

impl EcoflowFeed {
    pub async fn connect(
        certificate: &MqttCertificate,
        serial_number: &str,
        samples: SampleSender,
    ) -> anyhow::Result<Self> {
        let client_id = format!("ecoflow-smartmeter-{}", rand::rng().random_range(10000..1000000));
        let mut mqttoptions = MqttOptions::new(client_id, &certificate.host, certificate.port);
        mqttoptions.set_credentials(&certificate.account, &certificate.password);
        mqttoptions.set_keep_alive(Duration::from_secs(60));
        mqttoptions.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let shutdown = Arc::new(Notify::new());

        info!(
            "Connecting to EcoFlow broker {}:{}",
            certificate.host, certificate.port
        );

        let topic = quota_topic(&certificate.account, serial_number);
        let client_clone = client.clone();
        let shutdown_clone = shutdown.clone();
        let _eventloop_handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_clone.notified() => {
                        info!("Shutting down feed event loop");
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected, subscribing to {}", topic);
                            if let Err(e) = client_clone.try_subscribe(&topic, QoS::AtMostOnce) {
                                error!("Subscribe to {} failed: {:?}", topic, e);
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic == topic {
                                Self::handle_publish(&samples, &publish.payload);
                            } else {
                                debug!("Ignoring message on {}", publish.topic);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT event loop error: {:?}", e);
                            time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            client,
            shutdown,
            _eventloop_handle,
        })
    }

    fn handle_publish(samples: &SampleSender, payload: &[u8]) {
        match parse_quota_payload(payload) {
            Ok(Some(watts)) => {
                debug!("Output power {} W", watts);
                samples.send_replace(Some(PowerSample::now(watts)));
            }
            Ok(None) => debug!("Quota message without {}", OUTPUT_WATTS_FIELD),
            Err(e) => warn!("Dropping quota message: {}", e),
        }
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request failed: {:?}", e);
        }
        self.shutdown.notify_waiters();
    }
}

/// Hand every new sample to `handler` until the sending side goes away.
pub async fn forward_samples<H>(mut samples: SampleReceiver, handler: Arc<H>)
where
    H: HandleSample + Send + Sync + 'static,
{
    while samples.changed().await.is_ok() {
        let sample = *samples.borrow_and_update();
        if let Some(sample) = sample {
            handler.handle_sample(sample);
        }
    }
    debug!("Sample channel closed");
}
