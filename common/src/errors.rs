use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not connected to broker")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("broker refused connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),

    #[error("timed out waiting for broker after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
