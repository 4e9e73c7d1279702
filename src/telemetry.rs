use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::*;
use zenoh::{prelude::r#async::*, Session};

use crate::{error::ErrorWrapper, odometry::PoseHandle, pose::Pose};

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish(&self, pose: &Pose) -> Result<()>;
}

/// Writes the pose to the log.
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn publish(&self, pose: &Pose) -> Result<()> {
        info!("Chassis pose: {}", pose);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PoseMessage {
    x: f64,
    y: f64,
    theta: f64,
    time: DateTime<Utc>,
}

impl PoseMessage {
    fn new(pose: &Pose) -> Self {
        Self {
            x: pose.x(),
            y: pose.y(),
            theta: pose.theta(),
            time: Utc::now(),
        }
    }
}

/// Publishes the pose as JSON on a zenoh topic.
pub struct ZenohTelemetry {
    zenoh_session: Arc<Session>,
    topic: String,
}

impl ZenohTelemetry {
    pub fn new(zenoh_session: Arc<Session>, topic: &str) -> Self {
        Self {
            zenoh_session,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl TelemetrySink for ZenohTelemetry {
    async fn publish(&self, pose: &Pose) -> Result<()> {
        let json = serde_json::to_string(&PoseMessage::new(pose))?;
        self.zenoh_session
            .put(self.topic.as_str(), json)
            .res_async()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        Ok(())
    }
}

/// Sends a pose snapshot to `sink` every `period`. Failures are logged and
/// the next snapshot goes out as usual.
pub fn start_telemetry(
    pose: PoseHandle,
    sink: Box<dyn TelemetrySink>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = sink.publish(&pose.get()).await {
                warn!("Failed to publish telemetry {:?}", err);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct FlakySink {
        published: Arc<Mutex<Vec<Pose>>>,
    }

    #[async_trait]
    impl TelemetrySink for FlakySink {
        async fn publish(&self, pose: &Pose) -> Result<()> {
            let mut published = self.published.lock().unwrap();
            published.push(*pose);
            if published.len() % 2 == 0 {
                anyhow::bail!("link down");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_telemetry() {
        let pose = PoseHandle::new(Pose::new(1.0, 2.0, 3.0));
        let sink = FlakySink::default();
        let task = start_telemetry(pose.clone(), Box::new(sink.clone()), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(120)).await;
        pose.set(Pose::new(4.0, 5.0, 6.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let published = sink.published.lock().unwrap().clone();
        assert!(published.len() >= 4);
        assert_eq!(published[0], Pose::new(1.0, 2.0, 3.0));
        assert_eq!(*published.last().unwrap(), Pose::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn pose_message_is_flat_json() {
        let message = PoseMessage::new(&Pose::new(1.5, -2.0, 90.0));
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["x"], 1.5);
        assert_eq!(json["y"], -2.0);
        assert_eq!(json["theta"], 90.0);
        assert!(json["time"].is_string());
    }
}
