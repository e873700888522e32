use async_trait::async_trait;
use detector_proto::{
    detector_service_client::DetectorServiceClient, BoundingBox, ClassList, DetectRequest,
};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{sleep, timeout, Duration},
};
use tonic::{transport::Channel, Request, Status};
use tracing::instrument;

use crate::config::DetectorConfig;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to connect to detector service: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("Detection request failed: {0}")]
    RequestFailed(#[from] Status),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<BoundingBox> for Detection {
    fn from(bbox: BoundingBox) -> Self {
        Self {
            label: bbox.label,
            confidence: bbox.confidence,
            x1: bbox.x1,
            y1: bbox.y1,
            x2: bbox.x2,
            y2: bbox.y2,
        }
    }
}

/// Detection capability, owned by the host and handed to the pipeline.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn predict(
        &self,
        image_data: Vec<u8>,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError>;
}

pub struct GrpcDetector {
    client: Mutex<DetectorServiceClient<Channel>>,
}

impl GrpcDetector {
    pub async fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let mut client = Self::get_client(config.get_address()).await?;

        // The service needs the open-vocabulary class list before the
        // first prediction.
        let request = Request::new(ClassList {
            classes: config.classes.clone(),
        });
        client.set_classes(request).await?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    async fn get_client(address: String) -> Result<DetectorServiceClient<Channel>, DetectorError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let max_retries = 10;
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                DetectorServiceClient::connect(address.clone()),
            )
            .await
            {
                Ok(Ok(client)) => return Ok(client),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to detector service: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(DetectorError::MaxRetriesExceeded)
    }
}

#[async_trait]
impl Detector for GrpcDetector {
    #[instrument(skip(self, image_data))]
    async fn predict(
        &self,
        image_data: Vec<u8>,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let mut client = self.client.lock().await;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let request = Request::new(DetectRequest {
            image_data,
            confidence_threshold,
            timestamp,
        });

        let response = client.predict(request).await?;
        Ok(response
            .into_inner()
            .detections
            .into_iter()
            .map(Detection::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_keeps_wire_geometry_and_label() {
        let bbox = BoundingBox {
            x1: 1.0,
            y1: 2.0,
            x2: 3.0,
            y2: 4.0,
            confidence: 0.87,
            label: "banana".to_string(),
        };

        let detection = Detection::from(bbox);

        assert_eq!(detection.label, "banana");
        assert_eq!(detection.confidence, 0.87);
        assert_eq!(
            (detection.x1, detection.y1, detection.x2, detection.y2),
            (1.0, 2.0, 3.0, 4.0)
        );
    }
}
