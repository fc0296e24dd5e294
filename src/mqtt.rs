use anyhow::{Context, Result};
use darenbms_lib::telemetry::{
    self, Sensor, TelemetryRecord, TelemetrySink, VIRTUAL_BATTERY_KEY, VIRTUAL_BATTERY_SLUG,
};
use rumqttc::{Client, ClientError, LastWill, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;

const AVAILABILITY_ONLINE: &str = "online";
const AVAILABILITY_OFFLINE: &str = "offline";
const MANUFACTURER: &str = "Daren";
const MODEL: &str = "Daren BMS";
// rumqttc rejects keep alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_discovery_prefix")]
    discovery_prefix: String,
    #[serde(default = "MqttConfig::default_device_id")]
    device_id: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "bms".into()
    }

    fn default_discovery_prefix() -> String {
        "homeassistant".into()
    }

    fn default_device_id() -> String {
        "daren_bms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("darenbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                log::warn!("Invalid QoS {other}, using 0");
                QoS::AtMostOnce
            }
        }
    }

    fn availability_topic(&self) -> String {
        format!("{}/{}/availability", self.topic, self.device_id)
    }

    /// Home Assistant device id of a record key.
    fn device_id_for(&self, device_key: &str) -> String {
        if device_key == VIRTUAL_BATTERY_KEY {
            format!("{}_{VIRTUAL_BATTERY_SLUG}", self.device_id)
        } else {
            format!("{}_{}", self.device_id, telemetry::slug(device_key))
        }
    }

    fn state_topic(&self, device_id: &str, key: &str) -> String {
        format!("{}/{device_id}/{key}", self.topic)
    }

    fn discovery_topic(&self, device_id: &str, key: &str) -> String {
        format!("{}/sensor/{device_id}/{key}/config", self.discovery_prefix)
    }

    fn discovery_payload(
        &self,
        device_id: &str,
        device_name: &str,
        virtual_battery: bool,
        sensor: &Sensor,
    ) -> serde_json::Value {
        let model = if virtual_battery {
            format!("{MODEL} Virtual")
        } else {
            MODEL.to_string()
        };
        let mut payload = json!({
            "name": format!("{device_name} {}", sensor.name),
            "unique_id": format!("{device_id}_{}", sensor.key),
            "object_id": format!("{device_id}_{}", sensor.key),
            "state_topic": self.state_topic(device_id, sensor.key),
            "icon": sensor.icon,
            "device": {
                "identifiers": [device_id],
                "name": device_name,
                "manufacturer": MANUFACTURER,
                "model": model,
                "sw_version": env!("CARGO_PKG_VERSION"),
            },
            "availability": [{
                "topic": self.availability_topic(),
                "payload_available": AVAILABILITY_ONLINE,
                "payload_not_available": AVAILABILITY_OFFLINE,
            }],
        });
        let optional = [
            ("unit_of_measurement", sensor.unit),
            ("device_class", sensor.device_class),
            ("state_class", sensor.state_class),
        ];
        for (attribute, value) in optional {
            if let Some(value) = value {
                payload[attribute] = json!(value);
            }
        }
        payload
    }

    fn create_client(&self) -> Result<Client> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options.set_last_will(LastWill::new(
            self.availability_topic(),
            AVAILABILITY_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        log::info!(
            "Attempting to connect to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        let (client, mut connection) = Client::new(options, 64);

        // the connection must be polled for requests to go out; it reconnects
        // on the next iteration after an error
        let reconnect_interval = self.reconnect_interval;
        std::thread::Builder::new()
            .name("mqtt-connection".into())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(err) => {
                            log::warn!("MQTT connection error: {err}");
                            std::thread::sleep(reconnect_interval);
                        }
                    }
                }
            })
            .with_context(|| "Cannot start MQTT connection thread")?;
        Ok(client)
    }
}

/// Publishes records as Home Assistant sensors.
pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
    announced: HashSet<String>,
}

fn telemetry_error(err: ClientError) -> darenbms_lib::Error {
    darenbms_lib::Error::Telemetry(err.to_string())
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let client = config.create_client()?;
        let mut publisher = Self {
            client,
            config,
            announced: HashSet::new(),
        };
        publisher
            .set_availability(AVAILABILITY_ONLINE)
            .with_context(|| "Failed to publish availability")?;
        Ok(publisher)
    }

    fn set_availability(&mut self, payload: &str) -> Result<(), darenbms_lib::Error> {
        self.client
            .publish(
                self.config.availability_topic(),
                QoS::AtLeastOnce,
                true,
                payload,
            )
            .map_err(telemetry_error)
    }

    fn announce(
        &mut self,
        device_key: &str,
        record: &TelemetryRecord,
    ) -> Result<(), darenbms_lib::Error> {
        let device_id = self.config.device_id_for(device_key);
        let device_name = record
            .get("name")
            .and_then(|name| name.as_str())
            .unwrap_or(device_key)
            .to_string();
        let virtual_battery = device_key == VIRTUAL_BATTERY_KEY;
        for sensor in telemetry::sensors_for(device_key) {
            let payload = self.config.discovery_payload(
                &device_id,
                &device_name,
                virtual_battery,
                sensor,
            );
            self.client
                .publish(
                    self.config.discovery_topic(&device_id, sensor.key),
                    QoS::AtLeastOnce,
                    true,
                    payload.to_string(),
                )
                .map_err(telemetry_error)?;
        }
        log::info!("Published discovery for {device_name} ({device_id})");
        self.announced.insert(device_key.to_string());
        Ok(())
    }
}

impl Drop for MqttPublisher {
    /// Marks the device offline before the connection goes away.
    fn drop(&mut self) {
        if let Err(err) = self.set_availability(AVAILABILITY_OFFLINE) {
            log::warn!("Failed to publish availability: {err}");
        }
        if let Err(err) = self.client.disconnect() {
            log::warn!("Failed to disconnect from MQTT broker: {err}");
        }
    }
}

impl TelemetrySink for MqttPublisher {
    fn publish(
        &mut self,
        device_key: &str,
        record: &TelemetryRecord,
    ) -> Result<(), darenbms_lib::Error> {
        if !self.announced.contains(device_key) {
            self.announce(device_key, record)?;
        }
        let device_id = self.config.device_id_for(device_key);
        let qos = self.config.qos();
        let mut published = 0;
        for sensor in telemetry::sensors_for(device_key) {
            let Some(payload) = record.get(sensor.key).and_then(telemetry::state_payload) else {
                continue;
            };
            let topic = self.config.state_topic(&device_id, sensor.key);
            log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={qos:?}");
            self.client
                .publish(topic, qos, false, payload)
                .map_err(telemetry_error)?;
            published += 1;
        }
        log::debug!("Published {published} sensors for {device_key}");
        Ok(())
    }
}
